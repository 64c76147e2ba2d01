//! Transfer protocols exercised over the real pipe plane, including the
//! literal single-block XMODEM-CRC wire trace and the YMODEM batch-end
//! handshake.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use fidobbs::bbs::LinePipe;
use fidobbs::pipe::PipePlane;
use fidobbs::transfer::xmodem::{XmodemSender, ACK, EOT, PAD, SOH};
use fidobbs::transfer::ymodem::{YmodemFile, YmodemReceiver, YmodemSender};
use fidobbs::transfer::TransferState;

fn temp_file_with(content: &[u8]) -> std::fs::File {
    let mut f = tempfile::tempfile().unwrap();
    f.write_all(content).unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    f
}

fn drain_output(plane: &PipePlane, line: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 65536];
    let n = plane.read_output(line, &mut buf);
    buf.truncate(n);
    buf
}

#[test]
fn xmodem_crc_single_block_wire_trace() {
    // File "hello world\n"; receiver opens with C. Expected wire:
    // 01 01 FE, 12 payload bytes, 116 * 1A padding, CRC 0D 79, then EOT.
    let plane = PipePlane::new(1);
    let now = Instant::now();
    let mut sender = XmodemSender::new(temp_file_with(b"hello world\n"), 12, false, now);

    plane.push_input(0, 0x43).unwrap(); // 'C'
    let mut wire = Vec::new();
    for _ in 0..100 {
        let mut pipe = LinePipe { plane: &plane, line: 0 };
        sender.poll(&mut pipe, now).unwrap();
        wire.extend(drain_output(&plane, 0));
        if wire.len() >= 133 {
            break;
        }
    }
    assert_eq!(wire.len(), 133);
    assert_eq!(&wire[..3], &[SOH, 0x01, 0xFE]);
    assert_eq!(&wire[3..15], b"hello world\n");
    assert!(wire[15..131].iter().all(|&b| b == PAD));
    assert_eq!(&wire[131..133], &[0x0D, 0x79]);

    // ACK the block: the sender closes with EOT, ACKed in turn.
    plane.push_input(0, ACK).unwrap();
    let mut tail = Vec::new();
    for _ in 0..100 {
        let mut pipe = LinePipe { plane: &plane, line: 0 };
        sender.poll(&mut pipe, now).unwrap();
        tail.extend(drain_output(&plane, 0));
        if !tail.is_empty() {
            break;
        }
    }
    assert_eq!(tail, vec![EOT]);
    plane.push_input(0, ACK).unwrap();
    let mut done = false;
    for _ in 0..100 {
        let mut pipe = LinePipe { plane: &plane, line: 0 };
        if sender.poll(&mut pipe, now).unwrap() == TransferState::Complete {
            done = true;
            break;
        }
    }
    assert!(done);
}

#[test]
fn ymodem_empty_header_closes_batch_over_pipes() {
    // Two lines on one plane play the two ends; a shuttle moves each
    // side's output into the other side's input.
    let plane = PipePlane::new(2);
    let now = Instant::now();
    let recv_dir = tempfile::tempdir().unwrap();

    let payload = b"the only file in this batch".to_vec();
    let mut sender = YmodemSender::new(
        vec![YmodemFile {
            file: temp_file_with(&payload),
            name: "only.txt".into(),
            size: payload.len() as u64,
            mtime: 0,
        }],
        now,
    );
    let mut receiver = YmodemReceiver::new(recv_dir.path(), false, now);

    let mut finished = (false, false);
    for _ in 0..50_000 {
        {
            let mut pipe = LinePipe { plane: &plane, line: 0 };
            finished.0 = sender.poll(&mut pipe, now).unwrap() == TransferState::Complete;
        }
        // line0 output -> line1 input
        let bytes = drain_output(&plane, 0);
        assert_eq!(plane.enqueue_input(1, &bytes), bytes.len());
        {
            let mut pipe = LinePipe { plane: &plane, line: 1 };
            finished.1 = receiver.poll(&mut pipe, now).unwrap() == TransferState::Complete;
        }
        let bytes = drain_output(&plane, 1);
        assert_eq!(plane.enqueue_input(0, &bytes), bytes.len());
        if finished.0 && finished.1 {
            break;
        }
    }
    assert!(finished.0 && finished.1, "batch did not complete");

    // Exactly one file arrived; the empty block 0 ended the batch.
    assert_eq!(receiver.received_files().len(), 1);
    let mut got = Vec::new();
    std::fs::File::open(recv_dir.path().join("only.txt"))
        .unwrap()
        .read_to_end(&mut got)
        .unwrap();
    assert_eq!(got, payload);
}

#[test]
fn all_ff_payload_survives_iac_doubling_end_to_end() {
    // Telnet IAC doubling sits under the transfer layer: a payload of all
    // 0xFF must arrive intact when the wire doubles and un-doubles it.
    use fidobbs::transport::telnet::TelnetCodec;

    let plane = PipePlane::new(2);
    let now = Instant::now();
    let recv_dir = tempfile::tempdir().unwrap();
    let payload = vec![0xFFu8; 700];

    let mut sender = fidobbs::transfer::zmodem::ZmodemSender::new(
        temp_file_with(&payload),
        "ff.bin",
        payload.len() as u64,
        0,
        now,
    );
    let mut receiver = fidobbs::transfer::zmodem::ZmodemReceiver::new(recv_dir.path(), now);
    let mut a_codec = TelnetCodec::default();
    let mut b_codec = TelnetCodec::default();

    let mut finished = (false, false);
    for _ in 0..50_000 {
        {
            let mut pipe = LinePipe { plane: &plane, line: 0 };
            finished.0 = sender.poll(&mut pipe, now).unwrap() == TransferState::Complete;
        }
        // Sender output crosses a telnet hop in binary mode.
        let bytes = drain_output(&plane, 0);
        let wire = a_codec.encode(&bytes);
        let mut clean = Vec::new();
        let mut replies = Vec::new();
        b_codec.decode(&wire, true, &mut clean, &mut replies);
        assert!(replies.is_empty());
        assert_eq!(plane.enqueue_input(1, &clean), clean.len());
        {
            let mut pipe = LinePipe { plane: &plane, line: 1 };
            finished.1 = receiver.poll(&mut pipe, now).unwrap() == TransferState::Complete;
        }
        let bytes = drain_output(&plane, 1);
        let wire = b_codec.encode(&bytes);
        let mut clean = Vec::new();
        let mut replies = Vec::new();
        a_codec.decode(&wire, true, &mut clean, &mut replies);
        assert_eq!(plane.enqueue_input(0, &clean), clean.len());
        if finished.0 && finished.1 {
            break;
        }
    }
    assert!(finished.0 && finished.1);
    let got = std::fs::read(recv_dir.path().join("ff.bin")).unwrap();
    assert_eq!(got, payload);
}
