//! Property tests: signature stability, renderer determinism, counter
//! ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use cake_core::config::VoiceConfig;
use cake_core::events::{ErrorEvent, ErrorKind, StreamSource};
use cake_core::operator::{InterventionContext, OperatorEngine, strike_level};
use cake_core::recall::RecallStore;
use cake_core::signature::{Signature, signature_of};
use cake_core::voice::VoiceGate;

fn import_event(module: &str, path: &str, line: u32) -> ErrorEvent {
    ErrorEvent::new(
        ErrorKind::ImportMissing,
        StreamSource::Stderr,
        format!("ImportError: No module named '{module}'"),
        0,
    )
    .with_location(Some(path.to_string()), Some(line))
}

proptest! {
    /// Signatures collapse quoted names and line numbers: any module name
    /// at any line in the same file yields the same signature.
    #[test]
    fn signature_stable_across_modules_and_lines(
        module_a in "[a-z][a-z0-9_]{0,12}",
        module_b in "[a-z][a-z0-9_]{0,12}",
        line_a in 1u32..10_000,
        line_b in 1u32..10_000,
    ) {
        let a = signature_of(&import_event(&module_a, "/w/src/main.py", line_a));
        let b = signature_of(&import_event(&module_b, "/x/other/main.py", line_b));
        prop_assert_eq!(a, b);
    }

    /// Different basenames keep signatures apart.
    #[test]
    fn signature_distinguishes_basenames(
        module in "[a-z][a-z0-9_]{0,12}",
        line in 1u32..10_000,
    ) {
        let a = signature_of(&import_event(&module, "/w/a.py", line));
        let b = signature_of(&import_event(&module, "/w/b.py", line));
        prop_assert_ne!(a, b);
    }

    /// Building twice from the same context yields byte-identical output.
    #[test]
    fn operator_build_is_deterministic(
        module in "[A-Za-z0-9_./ -]{0,60}",
        path in "[A-Za-z0-9_./-]{1,40}",
        occurrences in 1u64..20,
    ) {
        let engine = OperatorEngine::new(
            VoiceGate::from_config(&VoiceConfig::default()).unwrap(),
        );
        let mut captures = HashMap::new();
        captures.insert("module".to_string(), module);
        let context = InterventionContext {
            kind: ErrorKind::ImportMissing,
            path: Some(path),
            line: Some(10),
            raw_message: "ImportError: No module named 'x'".to_string(),
            strike: strike_level(occurrences),
            prior_interventions: Vec::new(),
            remediation: None,
            timestamp: chrono::Utc::now(),
            captures,
        };
        let first = engine.build(&context);
        let second = engine.build(&context);
        prop_assert_eq!(first.text.as_bytes(), second.text.as_bytes());
        prop_assert_eq!(first.template_id, second.template_id);
        prop_assert!(first.text.len() <= 220);
    }

}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// success_count <= intervention_count <= occurrence_count holds under
    /// any interleaving of store operations.
    #[test]
    fn recall_counters_stay_ordered(ops in proptest::collection::vec(0u8..4, 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(
                RecallStore::open(dir.path().join("recall.db"), Duration::from_secs(3600))
                    .await
                    .unwrap(),
            );
            let sig = Signature::from_hex("ab".repeat(32));

            for op in ops {
                match op {
                    0 => {
                        store
                            .record(&sig, ErrorKind::TestFailure, "failed tests")
                            .await
                            .unwrap();
                    }
                    1 => store.mark_intervention(&sig, "msg").await.unwrap(),
                    2 => store.mark_outcome(&sig, true).await.unwrap(),
                    _ => store.mark_outcome(&sig, false).await.unwrap(),
                }
                if let Some(record) = store.lookup(&sig).await.unwrap() {
                    assert!(record.success_count <= record.intervention_count);
                    assert!(record.intervention_count <= record.occurrence_count);
                }
            }
        });
    }
}
