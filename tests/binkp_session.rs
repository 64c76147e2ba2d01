//! BinkP sessions over an in-memory duplex pair.

use std::path::Path;
use std::str::FromStr;

use fidobbs::ftn::addr::FtnAddress;
use fidobbs::ftn::binkp::{run_answerer, run_caller, Endpoint};

fn endpoint(inbound: &Path, akas: &[&str]) -> Endpoint {
    Endpoint {
        akas: akas.iter().map(|a| FtnAddress::from_str(a).unwrap()).collect(),
        system_name: "Test Node".into(),
        sysop: "Tester".into(),
        location: "Test Lab".into(),
        inbound_dir: inbound.to_path_buf(),
        files: vec![],
        freqs: vec![],
        freq_dir: None,
    }
}

#[tokio::test]
async fn minimal_handshake_closes_cleanly_with_no_artefacts() {
    // Caller presents 1:2/3 with the right password; both sides exchange
    // EOB immediately; nothing is created on disk anywhere.
    let caller_dir = tempfile::tempdir().unwrap();
    let answer_dir = tempfile::tempdir().unwrap();
    let (a, b) = tokio::io::duplex(1 << 20);
    let links = vec![(FtnAddress::from_str("1:2/3").unwrap(), "secret".to_string())];

    let caller_task = tokio::spawn(run_caller(
        a,
        endpoint(caller_dir.path(), &["1:2/3"]),
        "secret",
    ));
    let answerer = run_answerer(b, endpoint(answer_dir.path(), &["1:2/1"]), &links)
        .await
        .expect("answerer side");
    let caller = caller_task.await.unwrap().expect("caller side");

    assert!(caller.secure, "M_OK carried the secure marker");
    assert_eq!(caller.remote_akas[0].to_string(), "1:2/1");
    assert_eq!(answerer.remote_akas[0].to_string(), "1:2/3");
    assert!(caller.sent.is_empty() && caller.received.is_empty());
    assert!(answerer.sent.is_empty() && answerer.received.is_empty());
    assert_eq!(std::fs::read_dir(caller_dir.path()).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(answer_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn cram_md5_is_required_when_challenged() {
    // The answerer always offers a challenge; a caller with the wrong
    // password computes the wrong digest and is rejected.
    let caller_dir = tempfile::tempdir().unwrap();
    let answer_dir = tempfile::tempdir().unwrap();
    let (a, b) = tokio::io::duplex(1 << 20);
    let links = vec![(FtnAddress::from_str("1:2/3").unwrap(), "rightpw".to_string())];

    let caller_task = tokio::spawn(run_caller(
        a,
        endpoint(caller_dir.path(), &["1:2/3"]),
        "wrongpw",
    ));
    let answerer = run_answerer(b, endpoint(answer_dir.path(), &["1:2/1"]), &links).await;
    assert!(answerer.is_err());
    assert!(caller_task.await.unwrap().is_err());
}

#[tokio::test]
async fn mail_packet_crosses_the_wire() {
    let caller_dir = tempfile::tempdir().unwrap();
    let answer_dir = tempfile::tempdir().unwrap();
    let caller_in = caller_dir.path().join("inbound");
    let answer_in = answer_dir.path().join("inbound");

    let pkt = b"fake packet payload for the wire".to_vec();
    let pkt_path = caller_dir.path().join("00fa0000.pkt");
    std::fs::write(&pkt_path, &pkt).unwrap();

    let mut caller_ep = endpoint(&caller_in, &["1:2/3"]);
    caller_ep.files = vec![fidobbs::ftn::binkp::OutboundFile {
        path: pkt_path,
        name: "00fa0000.pkt".into(),
        size: pkt.len() as u64,
        mtime: 1_700_000_000,
    }];
    let answer_ep = endpoint(&answer_in, &["1:2/1"]);

    let (a, b) = tokio::io::duplex(1 << 20);
    let links = vec![(FtnAddress::from_str("1:2/3").unwrap(), "pw".to_string())];
    let caller_task = tokio::spawn(run_caller(a, caller_ep, "pw"));
    let answerer = run_answerer(b, answer_ep, &links).await.unwrap();
    let caller = caller_task.await.unwrap().unwrap();

    assert_eq!(caller.sent, vec!["00fa0000.pkt"]);
    assert_eq!(answerer.received.len(), 1);
    assert_eq!(std::fs::read(answer_in.join("00fa0000.pkt")).unwrap(), pkt);
}
