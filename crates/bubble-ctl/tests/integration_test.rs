use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn bin_path() -> String {
    // Prefer the test-built binary when available to avoid extra cargo builds.
    std::env::var("CARGO_BIN_EXE_bubble-ctl").unwrap_or_else(|_| {
        let candidates = [
            "../../target/release/bubble-ctl",
            "target/release/bubble-ctl",
            "../../target/debug/bubble-ctl",
            "target/debug/bubble-ctl",
        ];
        for candidate in candidates {
            if Path::new(candidate).exists() {
                return candidate.to_string();
            }
        }
        panic!("Failed to locate bubble-ctl binary. Expected CARGO_BIN_EXE_bubble-ctl.");
    })
}

struct Session {
    sequence_dir: PathBuf,
    save_dir: PathBuf,
    journal: PathBuf,
}

impl Session {
    fn new(root: &Path) -> Self {
        let session = Self {
            sequence_dir: root.join("ssbubble"),
            save_dir: root.join("data"),
            journal: root.join("journal.jsonl"),
        };
        fs::create_dir_all(&session.sequence_dir).unwrap();
        session
    }

    fn drop_sequence(&self, contents: &str) {
        fs::write(self.sequence_dir.join("sequence.txt"), contents).unwrap();
    }

    fn run(&self, seconds: u64) -> Output {
        Command::new(bin_path())
            .args(["--simulate", "--mode", "auto", "--run-seconds"])
            .arg(seconds.to_string())
            .arg("--sequence-dir")
            .arg(&self.sequence_dir)
            .arg("--save-dir")
            .arg(&self.save_dir)
            .arg("--journal")
            .arg(&self.journal)
            .env("RUST_LOG", "warn")
            .output()
            .expect("Failed to run bubble-ctl")
    }

    fn journal_events(&self) -> Vec<String> {
        fs::read_to_string(&self.journal)
            .unwrap()
            .lines()
            .map(|line| {
                let entry: serde_json::Value = serde_json::from_str(line).unwrap();
                entry["event_type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn handshake(&self) -> String {
        fs::read_to_string(self.sequence_dir.join("prospa.txt")).unwrap()
    }
}

#[test]
fn automatic_mode_runs_dropped_sequence_and_saves_csv() {
    let root = tempfile::tempdir().unwrap();
    let session = Session::new(root.path());
    let csv = root.path().join("results").join("run1.csv");
    session.drop_sequence(&format!("n300d300\n{}\n", csv.display()));

    let output = session.run(3);
    assert!(output.status.success(), "{output:?}");

    assert_eq!(session.handshake(), "1");
    assert!(!session.sequence_dir.join("sequence.txt").exists());

    let content = fs::read_to_string(&csv).unwrap();
    let mut lines = content.lines();
    assert_eq!(
        lines.next(),
        Some("Time,Pressure1,Pressure2,Pressure3,Pressure4")
    );
    assert!(lines.count() >= 1, "no pressure rows in {content}");

    let events = session.journal_events();
    assert_eq!(events.first().map(String::as_str), Some("system_start"));
    assert_eq!(events.last().map(String::as_str), Some("system_shutdown"));
    for expected in [
        "link_connected",
        "sequence_loaded",
        "sequence_started",
        "step_started",
        "sequence_completed",
        "pressure_log_saved",
    ] {
        assert!(events.iter().any(|e| e == expected), "missing {expected}: {events:?}");
    }
}

#[test]
fn rejected_sequence_answers_zero_and_drops_valve_link() {
    let root = tempfile::tempdir().unwrap();
    let session = Session::new(root.path());
    session.drop_sequence("q100\n");

    let output = session.run(2);
    assert!(output.status.success(), "{output:?}");

    assert_eq!(session.handshake(), "0");
    assert!(!session.sequence_dir.join("sequence.txt").exists());
    assert!(!session.save_dir.exists());

    let events = session.journal_events();
    assert!(events.iter().any(|e| e == "sequence_rejected"));
    assert!(!events.iter().any(|e| e == "sequence_started"));
}

#[test]
fn help_exits_cleanly() {
    let output = Command::new(bin_path())
        .arg("--help")
        .output()
        .expect("Failed to run bubble-ctl");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--sequence-dir"));
}

#[test]
fn bad_flag_value_exits_with_usage_error() {
    let output = Command::new(bin_path())
        .args(["--mode", "turbo"])
        .output()
        .expect("Failed to run bubble-ctl");
    assert_eq!(output.status.code(), Some(2));
}
