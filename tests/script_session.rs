//! Script execution through the real session host: interpreter, pipe
//! plane, terminal model and object store working together.

use std::time::Instant;

use fidobbs::config::Config;
use fidobbs::events::UiEvent;
use fidobbs::pipe::PipePlane;
use fidobbs::script::interp::{Interp, StepOutcome};
use fidobbs::script::Script;
use fidobbs::session::{HostCtx, LineState, Session};
use fidobbs::storage::Storage;
use tokio::sync::mpsc;

struct Fixture {
    _dir: tempfile::TempDir,
    storage: Storage,
    config: Config,
    plane: PipePlane,
    session: Session,
    events: mpsc::UnboundedSender<UiEvent>,
    events_rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let storage = Storage::open(dir.path(), &[], &[]).unwrap();
        let plane = PipePlane::new(1);
        let mut session = Session::new(0);
        session.connect("test-peer", Instant::now());
        let (events, events_rx) = mpsc::unbounded_channel();
        Fixture { _dir: dir, storage, config, plane, session, events, events_rx }
    }

    /// Run a script to completion (or until it starves for input).
    fn run(&mut self, source: &str) -> StepOutcome {
        let mut interp = Interp::new(Script::parse("main", source));
        let upload_dir = self.storage.root().join("Temp/line0");
        for _ in 0..50_000 {
            let mut host = HostCtx {
                core: &mut self.session.core,
                storage: &mut self.storage,
                plane: &self.plane,
                config: &self.config,
                online: &[],
                events: &self.events,
                upload_dir: upload_dir.clone(),
            };
            match interp.step(&mut host, Instant::now()) {
                StepOutcome::Ran => continue,
                StepOutcome::Suspended => {
                    if self.plane.input_available(0) == 0 {
                        return StepOutcome::Suspended;
                    }
                }
                done => return done,
            }
        }
        panic!("script did not settle");
    }

    fn output(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 65536];
        let n = self.plane.read_output(0, &mut buf);
        buf.truncate(n);
        buf
    }

    fn feed(&self, bytes: &[u8]) {
        assert_eq!(self.plane.enqueue_input(0, bytes), bytes.len());
    }
}

#[test]
fn if_then_else_emits_exact_bytes() {
    let mut fx = Fixture::new();
    let out = fx.run(
        "set a 5\nif %{a} > 3 && %{a} < 10 then\nprint `yes\\r\\n`\nelse\nprint `no\\r\\n`\nend if\n",
    );
    assert_eq!(out, StepOutcome::Finished);
    assert_eq!(fx.output(), vec![0x79, 0x65, 0x73, 0x0D, 0x0A]);
}

#[test]
fn for_with_continue_emits_odd_numbers() {
    let mut fx = Fixture::new();
    let out = fx.run(
        "for i = 1 to 5\nmod r %{i} 2\nif r == 0 then continue end if\nprint `%{i}\\r\\n`\nendfor\n",
    );
    assert_eq!(out, StepOutcome::Finished);
    assert_eq!(fx.output(), b"1\r\n3\r\n5\r\n");
}

#[test]
fn output_reaches_terminal_model_too() {
    let mut fx = Fixture::new();
    fx.run("print `hello\\r\\nworld`\n");
    let t = &fx.session.core.terminal;
    let row0: String = (0..5).map(|c| t.cell(0, c).ch).collect();
    let row1: String = (0..5).map(|c| t.cell(1, c).ch).collect();
    assert_eq!(row0, "hello");
    assert_eq!(row1, "world");
}

#[test]
fn logon_against_real_user_store() {
    let mut fx = Fixture::new();
    fx.storage.add_user("alice", "secret99", "Alice A", "").unwrap();
    fx.feed(b"alice\rsecret99\r");
    let out = fx.run("logon\nif %{registered} == 1 then\nprint `in!`\nend if\n");
    assert_eq!(out, StepOutcome::Finished);
    assert_eq!(fx.session.core.state, LineState::Authenticated);
    assert_eq!(fx.session.core.user.as_ref().unwrap().username, "alice");
    let out_bytes = fx.output();
    assert!(String::from_utf8_lossy(&out_bytes).contains("in!"));
    // The user-bound event reached the UI boundary.
    let mut saw_bound = false;
    while let Ok(ev) = fx.events_rx.try_recv() {
        if matches!(ev, UiEvent::LineUserBound { line: 0, ref real_name } if real_name == "Alice A") {
            saw_bound = true;
        }
    }
    assert!(saw_bound);
}

#[test]
fn three_bad_passwords_request_hangup() {
    let mut fx = Fixture::new();
    fx.storage.add_user("alice", "secret99", "Alice", "").unwrap();
    fx.feed(b"alice\rwrong1\ralice\rwrong2\ralice\rwrong3\r");
    fx.run("logon\nlogon\nlogon\nprint after\n");
    assert!(fx.session.core.hangup_requested);
    assert!(fx.session.core.user.is_none());
}

#[test]
fn detectansi_sets_macro_from_dsr_reply() {
    let mut fx = Fixture::new();
    fx.feed(b"\x1b[24;80R");
    fx.run("detectansi a 5000\nprint `ansi=%{a} macro=%{ansi}`\n");
    let out = String::from_utf8_lossy(&fx.output()).into_owned();
    assert!(out.starts_with("\x1b[6n"));
    assert!(out.contains("ansi=1 macro=1"));
    assert!(fx.session.core.ansi);
}

#[test]
fn sendmail_lands_in_store() {
    let mut fx = Fixture::new();
    fx.storage.add_user("bob", "password1", "Bob", "").unwrap();
    fx.run("sendmail bob `about things` `hello bob\\r\\n`\n");
    let messages = fx.storage.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to_name, "bob");
    assert!(messages[0].exported, "local mail must never reach the scanner");
    let body = fx.storage.message_body(messages[0].id).unwrap();
    assert_eq!(body, b"hello bob\r\n");
}

#[test]
fn doing_updates_activity_and_event() {
    let mut fx = Fixture::new();
    fx.run("doing `browsing files`\n");
    assert_eq!(fx.session.core.activity, "browsing files");
    let mut saw = false;
    while let Ok(ev) = fx.events_rx.try_recv() {
        if matches!(ev, UiEvent::LineActivity { line: 0, ref text } if text == "browsing files") {
            saw = true;
        }
    }
    assert!(saw);
}
