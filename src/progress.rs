//! Progress response normalization
//!
//! The progress endpoint does not answer with one canonical shape: the
//! percentage may sit in `percentage`, `percent` or `progress`, or only inside
//! a human readable message, and completion may be signalled by a status
//! token, by wording, or by the envelope code. Everything is folded into a
//! single [`ProgressReport`] here so the poll loop never looks at raw JSON.

use crate::api::is_success_code;
use serde_json::{Map, Value};

const COMPLETION_TOKENS: [&str; 5] = ["completed", "success", "done", "finish", "finished"];
const FAILURE_TOKENS: [&str; 2] = ["failed", "error"];
const SUCCESS_WORDING: [&str; 2] = ["成功", "success"];
const FAILURE_WORDING: [&str; 4] = ["失败", "错误", "fail", "error"];

const PERCENT_KEYS: [&str; 3] = ["percentage", "percent", "progress"];
const MESSAGE_KEYS: [&str; 3] = ["message", "progress", "msg"];
const DETAIL_KEYS: [&str; 5] = ["percentage", "percent", "progress", "message", "status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub status: ProgressStatus,
    /// Reported by the backend, either as a field or inside the message.
    pub percentage: Option<u8>,
    pub message: String,
}

/// Folds one progress response into a report.
///
/// Failure is checked before completion: a payload matching both is failed.
pub fn normalize(response: &Value) -> ProgressReport {
    let top = response.as_object();
    let code = top.and_then(|o| o.get("code")).and_then(Value::as_i64);

    // When `data` carries progress details, only those describe the task; the
    // envelope message then just describes the progress query itself.
    let detail = detail_source(response);
    let source: Option<&Map<String, Value>> = detail.as_ref().and_then(Detail::fields).or(top);

    let message = match &detail {
        Some(Detail::Text(text)) => text.trim().to_string(),
        _ => source.and_then(message_of).unwrap_or_default(),
    };

    let status_token = source
        .and_then(|o| o.get("status"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase());

    let percentage = source
        .and_then(explicit_percentage)
        .or_else(|| percentage_in_message(&message));

    let envelope_failed = code.map_or(false, is_error_code);
    let failed = status_token
        .as_deref()
        .map_or(false, |t| FAILURE_TOKENS.contains(&t))
        || contains_wording(&message, &FAILURE_WORDING)
        || envelope_failed;

    if failed {
        let message = if !message.is_empty() {
            message
        } else if let (true, Some(code)) = (envelope_failed, code) {
            format!("task failed with code {}", code)
        } else {
            "task failed".to_string()
        };
        return ProgressReport {
            status: ProgressStatus::Failed,
            percentage,
            message,
        };
    }

    let envelope_succeeded = detail.is_none()
        && code.map_or(false, is_success_code)
        && contains_wording(&message, &SUCCESS_WORDING);
    let completed = status_token
        .as_deref()
        .map_or(false, |t| COMPLETION_TOKENS.contains(&t))
        || contains_wording(&message, &SUCCESS_WORDING)
        || envelope_succeeded;

    ProgressReport {
        status: if completed {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Running
        },
        percentage,
        message,
    }
}

enum Detail<'a> {
    Fields(&'a Map<String, Value>),
    Text(&'a str),
}

impl<'a> Detail<'a> {
    fn fields(&self) -> Option<&'a Map<String, Value>> {
        match self {
            Detail::Fields(map) => Some(map),
            Detail::Text(_) => None,
        }
    }
}

fn detail_source(response: &Value) -> Option<Detail<'_>> {
    match response.get("data")? {
        Value::Object(map) if DETAIL_KEYS.iter().any(|k| map.contains_key(*k)) => {
            Some(Detail::Fields(map))
        }
        Value::String(text) if !text.trim().is_empty() => Some(Detail::Text(text)),
        _ => None,
    }
}

fn message_of(fields: &Map<String, Value>) -> Option<String> {
    MESSAGE_KEYS
        .iter()
        .filter_map(|k| fields.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty() && parse_percent_literal(s).is_none())
        .map(str::to_string)
}

fn explicit_percentage(fields: &Map<String, Value>) -> Option<u8> {
    PERCENT_KEYS.iter().find_map(|k| match fields.get(*k)? {
        Value::Number(n) => n.as_f64().and_then(clamp_percent),
        Value::String(s) => parse_percent_literal(s),
        _ => None,
    })
}

/// `"42"` or `"42%"`, nothing else.
fn parse_percent_literal(s: &str) -> Option<u8> {
    let s = s.trim();
    let s = s.strip_suffix('%').unwrap_or(s).trim_end();
    s.parse::<f64>().ok().and_then(clamp_percent)
}

fn clamp_percent(value: f64) -> Option<u8> {
    if value.is_nan() {
        return None;
    }
    Some(value.clamp(0.0, 100.0).round() as u8)
}

/// The last `NN%` (or `NN.N%`) in the message.
pub fn percentage_in_message(message: &str) -> Option<u8> {
    let chars: Vec<char> = message.chars().collect();
    chars
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, c)| **c == '%' || **c == '％')
        .find_map(|(idx, _)| {
            let mut start = idx;
            while start > 0 && (chars[start - 1].is_ascii_digit() || chars[start - 1] == '.') {
                start -= 1;
            }
            let number: String = chars[start..idx].iter().collect();
            let number = number.trim_start_matches('.');
            if number.is_empty() {
                return None;
            }
            number.parse::<f64>().ok().and_then(clamp_percent)
        })
}

fn contains_wording(message: &str, wording: &[&str]) -> bool {
    if message.is_empty() {
        return false;
    }
    let lowered = message.to_lowercase();
    wording.iter().any(|w| lowered.contains(w))
}

fn is_error_code(code: i64) -> bool {
    !is_success_code(code) && !(100..300).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_percentage_field() {
        let report = normalize(&json!({"data": {"percentage": 42}}));
        assert_eq!(report.percentage, Some(42));
        assert_eq!(report.status, ProgressStatus::Running);
    }

    #[test]
    fn explicit_percentage_is_clamped() {
        assert_eq!(normalize(&json!({"data": {"percent": 140}})).percentage, Some(100));
        assert_eq!(normalize(&json!({"data": {"progress": -3}})).percentage, Some(0));
        assert_eq!(normalize(&json!({"data": {"percent": "57.6%"}})).percentage, Some(58));
    }

    #[test]
    fn percentage_from_message() {
        let report = normalize(&json!({"msg": "进度 17% 完成"}));
        assert_eq!(report.percentage, Some(17));
        assert_eq!(report.status, ProgressStatus::Running);
        assert_eq!(report.message, "进度 17% 完成");
    }

    #[test]
    fn progress_string_is_a_message() {
        let report = normalize(&json!({"code": 200, "data": {"progress": "pulling layer 3/5 60%"}}));
        assert_eq!(report.message, "pulling layer 3/5 60%");
        assert_eq!(report.percentage, Some(60));
        assert_eq!(report.status, ProgressStatus::Running);
    }

    #[test]
    fn last_percent_in_message_wins() {
        assert_eq!(percentage_in_message("layer 100% done, total 35%"), Some(35));
        assert_eq!(percentage_in_message("no number %"), None);
        assert_eq!(percentage_in_message("12.5%"), Some(13));
        assert_eq!(percentage_in_message(""), None);
    }

    #[test]
    fn no_percentage_anywhere() {
        let report = normalize(&json!({"status": "running"}));
        assert_eq!(report.percentage, None);
        assert_eq!(report.status, ProgressStatus::Running);
    }

    #[test]
    fn envelope_success_completes() {
        let report = normalize(&json!({"code": 200, "msg": "操作成功"}));
        assert_eq!(report.status, ProgressStatus::Completed);
    }

    #[test]
    fn envelope_error_fails_with_message() {
        let report = normalize(&json!({"code": 500, "msg": "镜像拉取失败"}));
        assert_eq!(report.status, ProgressStatus::Failed);
        assert_eq!(report.message, "镜像拉取失败");
    }

    #[test]
    fn envelope_error_without_message_still_has_one() {
        let report = normalize(&json!({"code": 500}));
        assert_eq!(report.status, ProgressStatus::Failed);
        assert_eq!(report.message, "task failed with code 500");
    }

    #[test]
    fn completion_tokens() {
        for token in ["completed", "success", "done", "finish", "Finished"] {
            let report = normalize(&json!({"data": {"status": token}}));
            assert_eq!(report.status, ProgressStatus::Completed, "token {}", token);
        }
    }

    #[test]
    fn failure_tokens() {
        for token in ["failed", "ERROR"] {
            let report = normalize(&json!({"data": {"status": token}}));
            assert_eq!(report.status, ProgressStatus::Failed, "token {}", token);
            assert!(!report.message.is_empty());
        }
    }

    #[test]
    fn failure_beats_completion() {
        let report = normalize(&json!({"data": {"status": "done", "message": "更新失败"}}));
        assert_eq!(report.status, ProgressStatus::Failed);
        assert_eq!(report.message, "更新失败");
    }

    #[test]
    fn envelope_message_ignored_while_data_reports_progress() {
        let report = normalize(&json!({
            "code": 200,
            "msg": "success",
            "data": {"status": "running", "percentage": 30}
        }));
        assert_eq!(report.status, ProgressStatus::Running);
        assert_eq!(report.percentage, Some(30));
    }

    #[test]
    fn data_string_is_the_message() {
        let report = normalize(&json!({"code": 0, "data": "容器更新成功"}));
        assert_eq!(report.status, ProgressStatus::Completed);
        assert_eq!(report.message, "容器更新成功");
    }
}
