use lunahost::harness::HarnessCompiler;
use lunahost::{BlockOutcome, HostConfig, Reader, ScriptHost, UridMap, Urids};
use proptest::prelude::*;

/// A sequence header with the host's type id followed by arbitrary bytes.
fn sequence_of_garbage(urids: &Urids, body: &[u8], claimed: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + body.len());
    buf.extend_from_slice(&claimed.to_le_bytes());
    buf.extend_from_slice(&urids.sequence.to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

proptest! {
    #[test]
    fn rt_no_panic_fuzz(
        body in prop::collection::vec(any::<u8>(), 0..256),
        claimed in 0u32..512,
        out_len in 0usize..512,
        script in prop::sample::select(vec!["echo", "count", "echo\ncount", "churn 64\necho"]),
    ) {
        let config = HostConfig::default().with_initial_code(script);
        let (mut host, _worker) = ScriptHost::new(config, HarnessCompiler).unwrap();
        let input = sequence_of_garbage(host.urids(), &body, claimed);
        let mut output = vec![0u8; out_len];

        for _ in 0..3 {
            let outcome = host.process(&[&input], &mut [&mut output], 64);
            if out_len >= 8 {
                // Whatever happened, the port holds a readable atom.
                prop_assert!(host.reader().view(&output).is_some(), "{:?}", outcome);
            }
        }
    }

    #[test]
    fn reader_survives_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut map = UridMap::new();
        let reader = Reader::new(Urids::new(&mut map));
        if let Some(view) = reader.view(&bytes) {
            let _ = view.length();
            let _ = view.to_string();
            for (_, child) in view.iter() {
                let _ = child.value();
                let _ = child.iter().count();
            }
        }
    }
}

#[test]
fn panicking_script_keeps_host_alive() {
    let config = HostConfig::default().with_initial_code("panic");
    let (mut host, mut worker) = ScriptHost::new(config, HarnessCompiler).unwrap();
    let mut output = [0u8; 64];
    let input: [u8; 0] = [];
    assert!(matches!(
        host.process(&[&input], &mut [&mut output], 64),
        BlockOutcome::Bypassed(_)
    ));
    worker.load_script("echo").unwrap();
    assert_eq!(
        host.process(&[&input], &mut [&mut output], 64),
        BlockOutcome::Processed { replayed: false }
    );
}
