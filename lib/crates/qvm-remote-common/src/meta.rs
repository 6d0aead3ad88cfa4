//! Result metadata: the `.meta` file of a result bundle.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("metadata is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("metadata field '{field}' has unparseable value {value:?}")]
    BadValue { field: &'static str, value: String },
}

/// Everything the executor records about one finished request.
///
/// Rendered as `key=value` lines: `id`, `exit_code` and `duration_ms` are
/// always present; the boolean flags appear only when set, as `=1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMeta {
    pub id: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated_out: bool,
    pub truncated_err: bool,
    pub timed_out: bool,
}

impl ResultMeta {
    pub fn render(&self) -> String {
        let mut out = format!(
            "id={}\nexit_code={}\nduration_ms={}\n",
            self.id, self.exit_code, self.duration_ms
        );
        if self.truncated_out {
            out.push_str("truncated_out=1\n");
        }
        if self.truncated_err {
            out.push_str("truncated_err=1\n");
        }
        if self.timed_out {
            out.push_str("timeout=1\n");
        }
        out
    }

    /// Parse a rendered `.meta` file. Unknown keys are ignored so older
    /// readers keep working when fields are added.
    pub fn parse(text: &str) -> Result<Self, MetaError> {
        let mut meta = Self::default();
        let mut saw_id = false;
        let mut saw_exit = false;
        let mut saw_duration = false;
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "id" => {
                    meta.id = value.to_string();
                    saw_id = true;
                }
                "exit_code" => {
                    meta.exit_code = value.parse().map_err(|_| MetaError::BadValue {
                        field: "exit_code",
                        value: value.to_string(),
                    })?;
                    saw_exit = true;
                }
                "duration_ms" => {
                    meta.duration_ms = value.parse().map_err(|_| MetaError::BadValue {
                        field: "duration_ms",
                        value: value.to_string(),
                    })?;
                    saw_duration = true;
                }
                "truncated_out" => meta.truncated_out = value == "1",
                "truncated_err" => meta.truncated_err = value == "1",
                "timeout" => meta.timed_out = value == "1",
                _ => {}
            }
        }
        if !saw_id {
            return Err(MetaError::MissingField("id"));
        }
        if !saw_exit {
            return Err(MetaError::MissingField("exit_code"));
        }
        if !saw_duration {
            return Err(MetaError::MissingField("duration_ms"));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_minimal() {
        let meta = ResultMeta {
            id: "20260802-153000-4242-a1b2c3d4".into(),
            exit_code: 0,
            duration_ms: 12,
            ..Default::default()
        };
        assert_eq!(
            meta.render(),
            "id=20260802-153000-4242-a1b2c3d4\nexit_code=0\nduration_ms=12\n"
        );
    }

    #[test]
    fn test_flags_appear_only_when_set() {
        let meta = ResultMeta {
            id: "x".into(),
            exit_code: 124,
            duration_ms: 300_000,
            timed_out: true,
            ..Default::default()
        };
        let text = meta.render();
        assert!(text.contains("timeout=1\n"));
        assert!(!text.contains("truncated_out"));
        assert!(!text.contains("truncated_err"));
    }

    #[test]
    fn test_parse_round_trip() {
        let meta = ResultMeta {
            id: "x".into(),
            exit_code: 7,
            duration_ms: 99,
            truncated_out: true,
            truncated_err: false,
            timed_out: false,
        };
        assert_eq!(ResultMeta::parse(&meta.render()), Ok(meta));
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let parsed =
            ResultMeta::parse("id=x\nexit_code=0\nduration_ms=1\nfuture_field=abc\n")
                .expect("unknown keys ignored");
        assert_eq!(parsed.id, "x");
    }

    #[test]
    fn test_parse_requires_core_fields() {
        assert_eq!(
            ResultMeta::parse("exit_code=0\nduration_ms=1\n"),
            Err(MetaError::MissingField("id"))
        );
        assert_eq!(
            ResultMeta::parse("id=x\nexit_code=zero\nduration_ms=1\n"),
            Err(MetaError::BadValue {
                field: "exit_code",
                value: "zero".into()
            })
        );
    }
}
