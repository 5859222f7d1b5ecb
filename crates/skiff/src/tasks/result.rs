//! Extraction of structured task results from container logs.
//!
//! A task container reports its outcome by printing a JSON object anywhere
//! in its output. The object is recognized by shape: `completed` and
//! `needsInput` must both be present. Logs with no such object default to a
//! successful no-result outcome rather than leaving the task stuck.

use serde::{Deserialize, Serialize};

/// Structured result a task container may print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub completed: bool,
    pub needs_input: bool,
    #[serde(default)]
    pub input_request: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Outcome used when the logs contain no recognizable report.
pub fn fallback_report() -> TaskReport {
    TaskReport {
        completed: true,
        needs_input: false,
        input_request: String::new(),
        result: "Task executed".to_string(),
        error_message: String::new(),
        timestamp: String::new(),
    }
}

/// Find the last report-shaped JSON object in the log text.
///
/// Every `{` is a candidate start; a prefix parse from there either yields a
/// report or it doesn't. Surrounding noise, partial JSON, and unrelated
/// objects are all skipped.
pub fn extract_report(logs: &str) -> Option<TaskReport> {
    let mut found = None;
    for (index, _) in logs.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&logs[index..]).into_iter::<TaskReport>();
        if let Some(Ok(report)) = stream.next() {
            found = Some(report);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_report_embedded_in_noise() {
        let logs = "...noise... {\"completed\":true,\"needsInput\":false,\
                    \"inputRequest\":\"\",\"result\":\"ok\",\"errorMessage\":\"\",\
                    \"timestamp\":\"2024-01-01T00:00:00Z\"} ...noise...";
        let report = extract_report(logs).unwrap();
        assert!(report.completed);
        assert!(!report.needs_input);
        assert_eq!(report.result, "ok");
        assert_eq!(report.timestamp, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn last_report_wins() {
        let logs = r#"{"completed":false,"needsInput":false,"errorMessage":"first try"}
                      retrying...
                      {"completed":true,"needsInput":false,"result":"second try"}"#;
        let report = extract_report(logs).unwrap();
        assert!(report.completed);
        assert_eq!(report.result, "second try");
    }

    #[test]
    fn unrelated_objects_do_not_match() {
        let logs = r#"config loaded: {"level":"info","port":8080}
                      {"completed":"yes"} is not a report either"#;
        assert!(extract_report(logs).is_none());
    }

    #[test]
    fn needs_input_report() {
        let logs = r#"{"completed":false,"needsInput":true,"inputRequest":"which branch?"}"#;
        let report = extract_report(logs).unwrap();
        assert!(report.needs_input);
        assert_eq!(report.input_request, "which branch?");
    }

    #[test]
    fn no_report_yields_none_and_fallback_applies() {
        assert!(extract_report("plain text output only").is_none());
        let fallback = fallback_report();
        assert!(fallback.completed);
        assert!(!fallback.needs_input);
        assert_eq!(fallback.result, "Task executed");
    }

    #[test]
    fn multiline_pretty_json_is_found() {
        let logs = "done:\n{\n  \"completed\": true,\n  \"needsInput\": false,\n  \"result\": \"all green\"\n}\n";
        let report = extract_report(logs).unwrap();
        assert_eq!(report.result, "all green");
    }
}
