//! Pool wire messages: one JSON object per `\n`-terminated line.

use hds_miner_core::difficulty::Difficulty;
use hds_miner_core::work::Nonce;
use serde_json::{Map, Value, json};

use crate::error::ProtocolError;

/// Id the pool echoes on the login result.
pub(crate) const LOGIN_ID: &str = "login";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoginResult {
    pub(crate) code: i64,
    pub(crate) nonce_prefix: Option<Vec<u8>>,
    pub(crate) fork_height: Option<u64>,
    pub(crate) fork_height2: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobMessage {
    pub(crate) id: i64,
    pub(crate) header: [u8; 32],
    pub(crate) difficulty: Difficulty,
    pub(crate) nonce_prefix: Option<Vec<u8>>,
    pub(crate) height: Option<u64>,
    pub(crate) fork_height: Option<u64>,
    pub(crate) fork_height2: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Login(LoginResult),
    ShareResult { id: String, code: i64 },
    Job(JobMessage),
    Cancel { id: i64 },
    Other { method: Option<String> },
}

/// Field access with case-insensitive keys.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).or_else(|| {
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    fn string(&self, key: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(invalid(key, format!("expected a string, got {other}"))),
        }
    }

    fn u64(&self, key: &'static str) -> Result<Option<u64>, ProtocolError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(key, format!("{n} is not an unsigned integer"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| invalid(key, format!("{s:?}: {e}"))),
            Some(other) => Err(invalid(key, format!("expected a number, got {other}"))),
        }
    }

    fn i64(&self, key: &'static str) -> Result<Option<i64>, ProtocolError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(key, format!("{n} is not an integer"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| invalid(key, format!("{s:?}: {e}"))),
            Some(other) => Err(invalid(key, format!("expected a number, got {other}"))),
        }
    }

    fn hex(&self, key: &'static str) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.string(key)? {
            None => Ok(None),
            Some(s) => hex::decode(s.trim())
                .map(Some)
                .map_err(|e| invalid(key, e.to_string())),
        }
    }

    fn work_id(&self, key: &'static str) -> Result<i64, ProtocolError> {
        let id = self.u64(key)?.ok_or(ProtocolError::MissingField(key))?;
        i64::try_from(id).map_err(|_| invalid(key, format!("{id} exceeds the work id range")))
    }
}

fn invalid(field: &'static str, reason: String) -> ProtocolError {
    ProtocolError::InvalidField { field, reason }
}

/// Parse one inbound line. Unknown or missing methods are not errors.
pub(crate) fn parse_inbound(line: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(map) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    let fields = Fields(&map);

    let Some(method) = fields.string("method")? else {
        return Ok(Inbound::Other { method: None });
    };

    match method.as_str() {
        "result" => {
            let id = fields.string("id")?.ok_or(ProtocolError::MissingField("id"))?;
            let code = fields.i64("code")?.ok_or(ProtocolError::MissingField("code"))?;
            if id == LOGIN_ID {
                Ok(Inbound::Login(LoginResult {
                    code,
                    nonce_prefix: fields.hex("nonceprefix")?,
                    fork_height: fields.u64("forkheight")?,
                    fork_height2: fields.u64("forkheight2")?,
                }))
            } else {
                Ok(Inbound::ShareResult { id, code })
            }
        }
        "job" => {
            let input = fields.hex("input")?.ok_or(ProtocolError::MissingField("input"))?;
            let header: [u8; 32] = input
                .as_slice()
                .try_into()
                .map_err(|_| invalid("input", format!("expected 32 bytes, got {}", input.len())))?;
            let id = fields.work_id("id")?;
            let difficulty = fields
                .u64("difficulty")?
                .ok_or(ProtocolError::MissingField("difficulty"))?;
            let difficulty = u32::try_from(difficulty)
                .map_err(|_| invalid("difficulty", format!("{difficulty} does not fit 32 bits")))?;

            Ok(Inbound::Job(JobMessage {
                id,
                header,
                difficulty: Difficulty::from_packed(difficulty),
                nonce_prefix: fields.hex("nonceprefix")?,
                height: fields.u64("height")?,
                fork_height: fields.u64("forkheight")?,
                fork_height2: fields.u64("forkheight2")?,
            }))
        }
        "cancel" => Ok(Inbound::Cancel {
            id: fields.work_id("id")?,
        }),
        _ => Ok(Inbound::Other {
            method: Some(method),
        }),
    }
}

/// The login request, newline-terminated.
pub(crate) fn login_line(api_key: &str) -> String {
    let msg = json!({
        "method": "login",
        "api_key": api_key,
        "id": LOGIN_ID,
        "jsonrpc": "2.0",
    });
    format!("{msg}\n")
}

/// A solution submission, newline-terminated.
pub(crate) fn solution_line(work_id: i64, nonce: &Nonce, encoded: &[u8]) -> String {
    let msg = json!({
        "method": "solution",
        "id": work_id.to_string(),
        "nonce": nonce.to_hex(),
        "output": hex::encode(encoded),
        "jsonrpc": "2.0",
    });
    format!("{msg}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn parses_job_with_optional_fields() {
        let line = format!(
            r#"{{"method":"job","id":5,"input":"{HEADER_HEX}","difficulty":"16777216","nonceprefix":"abcd","height":150}}"#
        );
        let Inbound::Job(job) = parse_inbound(&line).unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(job.id, 5);
        assert_eq!(job.header[31], 0x1f);
        assert_eq!(job.difficulty.packed(), 1 << 24);
        assert_eq!(job.nonce_prefix, Some(vec![0xab, 0xcd]));
        assert_eq!(job.height, Some(150));
        assert_eq!(job.fork_height, None);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let line = format!(r#"{{"Method":"job","ID":"9","Input":"{HEADER_HEX}","DIFFICULTY":0}}"#);
        assert!(matches!(parse_inbound(&line).unwrap(), Inbound::Job(JobMessage { id: 9, .. })));
    }

    #[test]
    fn login_and_share_results() {
        let login = parse_inbound(
            r#"{"method":"result","id":"login","code":0,"nonceprefix":"01","forkheight":100,"forkheight2":200}"#,
        )
        .unwrap();
        assert_eq!(
            login,
            Inbound::Login(LoginResult {
                code: 0,
                nonce_prefix: Some(vec![1]),
                fork_height: Some(100),
                fork_height2: Some(200),
            })
        );

        let share = parse_inbound(r#"{"method":"result","id":"17","code":-3,"description":"low"}"#).unwrap();
        assert_eq!(
            share,
            Inbound::ShareResult {
                id: "17".to_string(),
                code: -3
            }
        );
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(matches!(parse_inbound("{not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(parse_inbound("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            parse_inbound(r#"{"method":"job","id":1,"difficulty":0}"#),
            Err(ProtocolError::MissingField("input"))
        ));
        assert!(matches!(
            parse_inbound(r#"{"method":"job","id":1,"input":"abcd","difficulty":0}"#),
            Err(ProtocolError::InvalidField { field: "input", .. })
        ));
        let line = format!(r#"{{"method":"job","id":1,"input":"{HEADER_HEX}","difficulty":4294967296}}"#);
        assert!(matches!(
            parse_inbound(&line),
            Err(ProtocolError::InvalidField { field: "difficulty", .. })
        ));
        assert!(matches!(
            parse_inbound(r#"{"method":"cancel"}"#),
            Err(ProtocolError::MissingField("id"))
        ));
    }

    #[test]
    fn unknown_or_missing_method_is_ignored() {
        assert_eq!(
            parse_inbound(r#"{"id":"x"}"#).unwrap(),
            Inbound::Other { method: None }
        );
        assert_eq!(
            parse_inbound(r#"{"method":"ping"}"#).unwrap(),
            Inbound::Other {
                method: Some("ping".to_string())
            }
        );
    }

    #[test]
    fn outbound_lines() {
        let login: Value = serde_json::from_str(login_line("secret").trim_end()).unwrap();
        assert_eq!(login["method"], "login");
        assert_eq!(login["api_key"], "secret");
        assert_eq!(login["id"], "login");
        assert_eq!(login["jsonrpc"], "2.0");

        let line = solution_line(42, &Nonce([1, 2, 3, 4, 5, 6, 7, 8]), &[0xde, 0xad]);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let solution: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(solution["method"], "solution");
        assert_eq!(solution["id"], "42");
        assert_eq!(solution["nonce"], "0102030405060708");
        assert_eq!(solution["output"], "dead");
    }
}
