//! End-to-end echomail: a local post on node A is scanned, packed, carried
//! to node B's inbound spool, and tossed into B's message base - and a
//! looped copy is dropped on the floor.

mod common;

use chrono::Utc;
use fidobbs::ftn::addr::FtnAddress;
use fidobbs::ftn::echofix::SubscriptionStore;
use fidobbs::ftn::outbound::OutboundQueue;
use fidobbs::ftn::packet;
use fidobbs::ftn::scanner::Scanner;
use fidobbs::ftn::tosser::{Tosser, TossStats};
use fidobbs::storage::{MessageKind, MessageRecord};

fn local_echo_record() -> MessageRecord {
    MessageRecord {
        id: 0,
        base: "main".into(),
        area: "TEST".into(),
        kind: MessageKind::Echo,
        deleted: false,
        access_level: 0,
        keys: 0,
        subject: "round trip".into(),
        from_name: "Alice".into(),
        to_name: "All".into(),
        sender_id: Some(1),
        orig: None,
        dest: None,
        imported: Utc::now(),
        sent: None,
        read_at: None,
        read_count: 0,
        body_len: 0,
        exported: false,
        flags: 0,
    }
}

#[test]
fn echomail_travels_from_node_a_to_node_b() {
    // Node A: 2:250/6, uplinked to 2:250/0. Node B: 2:250/0 itself.
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let cfg_a = common::ftn_config(dir_a.path(), "2:250/6", "2:250/0");
    let cfg_b = common::ftn_config(dir_b.path(), "2:250/0", "2:250/99");

    // A posts and scans.
    let mut storage_a = common::open_storage(dir_a.path(), &cfg_a);
    storage_a
        .store_message(local_echo_record(), b"hello from node A\r")
        .unwrap();
    let subs_a = SubscriptionStore::load(&dir_a.path().join("subs.json"), &[]).unwrap();
    let outbound_a = OutboundQueue::new(&dir_a.path().join("FTN/Outbound"), "fidonet");
    let scanner = Scanner::new(&cfg_a);
    let stats = scanner.scan(&mut storage_a, &subs_a, &outbound_a, &cfg_a).unwrap();
    assert_eq!(stats.echo_destinations, 1);

    // The queued packet decodes and carries the full dressing.
    let uplink: FtnAddress = "2:250/0@fidonet".parse().unwrap();
    let queued = outbound_a.list(&uplink).unwrap();
    assert_eq!(queued.len(), 1);
    let pkt_bytes = std::fs::read(&queued[0].path).unwrap();
    let (header, msgs) = packet::decode_packet(&pkt_bytes).unwrap();
    assert_eq!(header.password, "linkpw");
    assert_eq!(packet::area_tag(&msgs[0].body).as_deref(), Some("TEST"));
    assert!(packet::seen_by_entries(&msgs[0].body).contains(&(250, 6)));

    // Carry it into B's inbound spool and toss.
    let inbound_b = dir_b.path().join("FTN/Inbound/fidonet/2");
    std::fs::create_dir_all(&inbound_b).unwrap();
    std::fs::write(inbound_b.join("00000001.pkt"), &pkt_bytes).unwrap();

    let mut storage_b = common::open_storage(dir_b.path(), &cfg_b);
    let mut subs_b = SubscriptionStore::load(&dir_b.path().join("subs.json"), &[]).unwrap();
    let mut tosser = Tosser::new(&cfg_b);
    let stats = tosser.toss_all(&mut storage_b, &mut subs_b, &cfg_b).unwrap();
    assert_eq!(stats.stored, 1);

    let stored = &storage_b.messages()[0];
    assert_eq!(stored.area, "TEST");
    assert_eq!(stored.from_name, "Alice");
    let body = storage_b.message_body(stored.id).unwrap();
    assert!(String::from_utf8_lossy(&body).contains("hello from node A"));
    // B appended its own AKA on import.
    assert!(packet::seen_by_entries(&body).contains(&(250, 0)));

    // The artefact was archived, not left in the spool.
    assert!(inbound_b.join("Processed/00000001.pkt").exists());
    assert!(!inbound_b.join("00000001.pkt").exists());
}

#[test]
fn looped_echomail_is_dropped_and_logged() {
    // A message for TEST whose SEEN-BY already lists our AKA 2:250/0:
    // dropped with one FTN log entry, the packet still lands in
    // Processed/, and the message base stays empty.
    let dir = tempfile::tempdir().unwrap();
    let cfg = common::ftn_config(dir.path(), "2:250/0", "2:250/99");
    let mut storage = common::open_storage(dir.path(), &cfg);
    let mut subs = SubscriptionStore::load(&dir.path().join("subs.json"), &[]).unwrap();

    let header = packet::PacketHeader::new(
        "2:250/99".parse().unwrap(),
        "2:250/0".parse().unwrap(),
        "",
        Utc::now(),
    );
    let msg = packet::PackedMessage {
        orig: "2:250/99".parse().unwrap(),
        dest: "2:250/0".parse().unwrap(),
        attributes: 0,
        cost: 0,
        datetime: packet::format_datetime(Utc::now()),
        to: "All".into(),
        from: "Echo Gateway".into(),
        subject: "seen it".into(),
        body: b"\x01AREA:TEST\rlooped text\r\x01SEEN-BY: 250/0 99\r".to_vec(),
    };
    let pkt = packet::encode_packet(&header, &[msg]);
    let inbound = dir.path().join("FTN/Inbound/fidonet/2");
    std::fs::create_dir_all(&inbound).unwrap();
    std::fs::write(inbound.join("loop.pkt"), &pkt).unwrap();

    let mut tosser = Tosser::new(&cfg);
    let stats = tosser.toss_all(&mut storage, &mut subs, &cfg).unwrap();
    assert_eq!(
        stats,
        TossStats { packets: 1, loops: 1, ..Default::default() }
    );
    assert!(storage.messages().is_empty());
    assert!(inbound.join("Processed/loop.pkt").exists());

    let log = std::fs::read_to_string(dir.path().join("Logs/FTN")).unwrap();
    assert_eq!(log.lines().filter(|l| l.contains("loop dropped")).count(), 1);
}
