use std::io::Write;

use epochguard_harness::scenarios::{Scenario, expect_pass};
use epochguard_harness::{LogEmitter, validate_log_file};
use epochguard_membrane::FaultKind;

#[test]
fn every_scenario_passes_and_logs_valid_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");
    {
        let mut log = LogEmitter::to_file(&path, "it").unwrap();
        for scenario in Scenario::ALL {
            let summary = expect_pass(scenario, &mut log).unwrap();
            assert!(summary.runs >= 2, "{} was not replayed", scenario.name());
        }
    }
    let (lines, errors) = validate_log_file(&path).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    // start, fault and end for each scenario.
    assert_eq!(lines, 3 * Scenario::ALL.len());
}

#[test]
fn overflow_log_carries_the_localized_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overflow.jsonl");
    {
        let mut log = LogEmitter::to_file(&path, "ovf").unwrap();
        expect_pass(Scenario::Overflow, &mut log).unwrap();
    }
    let text = std::fs::read_to_string(&path).unwrap();
    let fault = text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
        .find(|v| v["event"] == "fault")
        .unwrap();
    assert_eq!(fault["trace_id"], "ovf::002");
    assert_eq!(fault["fault"]["kind"], FaultKind::Overflow.as_str());
    assert_eq!(fault["fault"]["localized"], true);
    assert_eq!(fault["fault"]["offset"], 16);
}

#[test]
fn validator_counts_bad_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"r::001","level":"info","event":"scenario_start"}}"#
    )
    .unwrap();
    writeln!(file).unwrap();
    writeln!(file, r#"{{"trace_id":"r::002","level":"info"}}"#).unwrap();
    writeln!(file, "garbage").unwrap();
    file.flush().unwrap();

    let (lines, errors) = validate_log_file(file.path()).unwrap();
    assert_eq!(lines, 3);
    assert!(errors.iter().any(|e| e.line_number == 3 && e.field == "timestamp"));
    assert!(errors.iter().any(|e| e.line_number == 4 && e.field == "<json>"));
    assert!(errors.iter().all(|e| e.line_number != 1));
}
