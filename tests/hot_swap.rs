//! Script replacement through control messages, with state carried over.

use lunahost::harness::RtHarness;
use lunahost::host::BypassReason;
use lunahost::{BlockOutcome, ControlMessage, Forge, HostConfig, HostError, Key, ScriptError};

fn message(h: &RtHarness, msg: ControlMessage<'_>) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let mut forge = Forge::new(&mut buf, *h.host.urids());
    msg.forge(&mut forge).unwrap();
    let len = forge.finish().unwrap();
    buf.truncate(len);
    buf
}

/// Drain `control_out` into owned messages.
fn notifications(h: &mut RtHarness, frames: u32) -> Vec<(i64, String, String)> {
    let mut buf = vec![0u8; 8192];
    h.host.control_out(&mut buf, frames).unwrap();
    let seq = h.reader().view(&buf).unwrap();
    seq.iter()
        .filter_map(|(key, view)| {
            let Key::Time(t) = key else { return None };
            let (kind, text) = match ControlMessage::from_view(view)? {
                ControlMessage::Code(s) => ("code", s),
                ControlMessage::Error(s) => ("error", s),
                ControlMessage::Trace(s) => ("trace", s),
            };
            Some((t, kind.to_string(), text.to_string()))
        })
        .collect()
}

#[test]
fn code_message_replaces_script_and_echoes() {
    let mut h = RtHarness::new(HostConfig::default()).unwrap();
    h.set_input(0, &[(2, 7)]);
    assert_eq!(
        h.run_block(64),
        BlockOutcome::Bypassed(BypassReason::NoScript)
    );

    let msg = message(&h, ControlMessage::Code("echo"));
    assert!(h.worker.control_in(&msg).unwrap());
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: false });
    assert_eq!(h.output_events(0), vec![(2, 7)]);

    assert_eq!(
        notifications(&mut h, 64),
        vec![(63, "code".to_string(), "echo".to_string())]
    );
    assert!(notifications(&mut h, 64).is_empty());
}

#[test]
fn compile_failure_keeps_previous_script() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("echo")).unwrap();
    notifications(&mut h, 64);

    let msg = message(&h, ControlMessage::Code("echo\nhold lots"));
    let err = h.worker.control_in(&msg).unwrap_err();
    assert!(matches!(err, HostError::Script(ScriptError::Compile(_))));

    h.set_input(0, &[(9, 1)]);
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: false });
    assert_eq!(h.output_events(0), vec![(9, 1)]);

    let notes = notifications(&mut h, 64);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].1, "error");
    assert!(notes[0].2.contains("line 2"), "{}", notes[0].2);
}

#[test]
fn counter_survives_swap() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("count")).unwrap();
    h.set_input(0, &[(0, 0), (1, 0)]);
    for _ in 0..3 {
        h.run_block(16);
    }
    assert_eq!(h.output_events(0), vec![(15, 6)]);

    h.worker.load_script("echo\ncount").unwrap();
    h.set_input(0, &[(4, 42)]);
    h.run_block(16);
    assert_eq!(h.output_events(0), vec![(4, 42), (15, 7)]);
}

#[test]
fn reload_clears_sticky_error() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("fail")).unwrap();
    assert_eq!(h.run_block(64), BlockOutcome::Bypassed(BypassReason::Error));
    assert_eq!(h.run_block(64), BlockOutcome::Bypassed(BypassReason::Disabled));

    let notes = notifications(&mut h, 64);
    let kinds: Vec<&str> = notes.iter().map(|(_, k, _)| k.as_str()).collect();
    assert_eq!(kinds, vec!["code", "error"]);

    h.worker.load_script("echo").unwrap();
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: false });
}

#[test]
fn non_code_messages_are_ignored() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("echo")).unwrap();
    let msg = message(&h, ControlMessage::Trace("hello"));
    assert!(!h.worker.control_in(&msg).unwrap());
    assert!(!h.worker.control_in(&[1, 2, 3]).unwrap());
    assert_eq!(h.worker.lock().code(), "echo");
}

#[test]
fn state_moves_between_hosts() {
    let mut a = RtHarness::new(HostConfig::default().with_initial_code("count")).unwrap();
    a.set_input(0, &[(0, 0), (3, 0), (8, 0)]);
    a.run_block(32);
    let state = a.worker.save_state().unwrap();

    let mut b = RtHarness::new(HostConfig::default().with_initial_code("count")).unwrap();
    b.worker.restore_state(&state).unwrap();
    b.set_input(0, &[(1, 0)]);
    b.run_block(32);
    assert_eq!(b.output_events(0), vec![(31, 4)]);
}

#[test]
fn trace_lines_reach_control_out() {
    let config = HostConfig::default().with_initial_code("trace first\ntrace second");
    let mut h = RtHarness::new(config).unwrap();
    notifications(&mut h, 64);
    h.run_block(64);
    h.run_block(64);
    let traces: Vec<String> = notifications(&mut h, 64)
        .into_iter()
        .filter(|(_, k, _)| k == "trace")
        .map(|(_, _, t)| t)
        .collect();
    assert_eq!(traces, vec!["first", "second", "first", "second"]);
}
