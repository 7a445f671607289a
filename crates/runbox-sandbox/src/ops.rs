//! deno_core op definitions for the Runbox sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use base64::Engine as _;
use chrono::SecondsFormat;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Digest;
use tokio::sync::Notify;

/// Largest buffer `crypto.randomBytes` will produce in one call.
pub const MAX_RANDOM_BYTES: usize = 64 * 1024;

/// Log lines captured from `console.*` during one run.
#[derive(Debug)]
pub struct CapturedLog {
    lines: Vec<String>,
    bytes: usize,
    max_bytes: usize,
    overflowed: bool,
}

impl CapturedLog {
    /// An empty capture buffer holding at most `max_bytes` of joined output.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            max_bytes,
            overflowed: false,
        }
    }

    /// Append a line. Lines past the byte cap are dropped and the buffer is
    /// marked overflowed.
    pub fn push(&mut self, line: String) {
        let added = if self.lines.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if self.overflowed || self.bytes + added > self.max_bytes {
            self.overflowed = true;
            return;
        }
        self.bytes += added;
        self.lines.push(line);
    }

    /// Whether any line was dropped for exceeding the cap.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Take the captured lines in emission order.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// The first uncaught failure reported by the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    /// The thrown value's `name`, e.g. `TypeError` or `CapabilityDeniedError`.
    pub name: String,
    /// The thrown value's message.
    pub message: String,
}

/// Slot for the first failure of a run.
#[derive(Debug, Default)]
pub struct FailureSlot(pub Option<RecordedFailure>);

/// Pending timer waits, keyed by the id the bootstrap assigned.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    waiting: HashMap<u32, Rc<Notify>>,
    cancelled: HashSet<u32>,
}

impl TimerRegistry {
    fn register(&mut self, id: u32) -> Option<Rc<Notify>> {
        if self.cancelled.remove(&id) {
            return None;
        }
        let notify = Rc::new(Notify::new());
        self.waiting.insert(id, notify.clone());
        Some(notify)
    }

    fn cancel(&mut self, id: u32) {
        match self.waiting.remove(&id) {
            Some(notify) => notify.notify_one(),
            None => {
                self.cancelled.insert(id);
            }
        }
    }

    fn finish(&mut self, id: u32) {
        self.waiting.remove(&id);
    }

    /// Number of timers currently waiting.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }
}

/// Format one console line the way execution output is stored.
pub fn format_log_line(level: &str, msg: &str) -> String {
    let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match level {
        "error" => format!("[{ts}] ERROR: {msg}"),
        "warn" => format!("[{ts}] WARN: {msg}"),
        _ => format!("[{ts}] {msg}"),
    }
}

/// Record a console line from sandbox code.
#[op2(fast)]
pub fn op_runbox_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    tracing::debug!(target: "runbox::sandbox::js", level, "{}", msg);
    let line = format_log_line(level, msg);
    state.borrow_mut::<CapturedLog>().push(line);
}

/// Record the first uncaught failure of the run. Later failures are ignored.
#[op2(fast)]
pub fn op_runbox_fail(state: &mut OpState, #[string] name: &str, #[string] message: &str) {
    let slot = state.borrow_mut::<FailureSlot>();
    if slot.0.is_none() {
        slot.0 = Some(RecordedFailure {
            name: name.to_string(),
            message: message.to_string(),
        });
    }
}

/// Wait `delay_ms` for timer `id`. Resolves `true` when the delay elapsed and
/// `false` when the timer was cancelled first.
#[op2(async)]
pub async fn op_runbox_timer_wait(
    state: Rc<RefCell<OpState>>,
    #[smi] id: u32,
    #[smi] delay_ms: u32,
) -> bool {
    let cancel = state.borrow_mut().borrow_mut::<TimerRegistry>().register(id);
    let Some(cancel) = cancel else {
        return false;
    };

    let fired = tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))) => true,
        _ = cancel.notified() => false,
    };

    state.borrow_mut().borrow_mut::<TimerRegistry>().finish(id);
    fired
}

/// Cancel timer `id`, waking its pending wait.
#[op2(fast)]
pub fn op_runbox_timer_cancel(state: &mut OpState, #[smi] id: u32) {
    state.borrow_mut::<TimerRegistry>().cancel(id);
}

fn unknown_encoding(encoding: &str) -> JsErrorBox {
    JsErrorBox::type_error(format!("Unknown encoding: {encoding}"))
}

/// Encode bytes as text.
#[op2]
#[string]
pub fn op_runbox_encode(
    #[buffer] data: &[u8],
    #[string] encoding: &str,
) -> Result<String, JsErrorBox> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(data).into_owned()),
        "hex" => Ok(hex::encode(data)),
        "base64" => Ok(base64::engine::general_purpose::STANDARD.encode(data)),
        "base64url" => Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)),
        "latin1" | "binary" => Ok(data.iter().map(|&b| b as char).collect()),
        "ascii" => Ok(data.iter().map(|&b| (b & 0x7f) as char).collect()),
        _ => Err(unknown_encoding(encoding)),
    }
}

/// Decode text into bytes.
#[op2]
#[buffer]
pub fn op_runbox_decode(
    #[string] text: &str,
    #[string] encoding: &str,
) -> Result<Vec<u8>, JsErrorBox> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(text.as_bytes().to_vec()),
        "hex" => {
            // Node stops at the first invalid pair instead of throwing.
            let valid: String = text
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            let even = valid.len() - valid.len() % 2;
            hex::decode(&valid[..even]).map_err(|e| JsErrorBox::type_error(e.to_string()))
        }
        "base64" | "base64url" => {
            let cleaned: String = text
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '=')
                .map(|c| match c {
                    '-' => '+',
                    '_' => '/',
                    c => c,
                })
                .collect();
            base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(cleaned)
                .map_err(|e| JsErrorBox::type_error(format!("invalid base64: {e}")))
        }
        "latin1" | "binary" | "ascii" => Ok(text.chars().map(|c| c as u32 as u8).collect()),
        _ => Err(unknown_encoding(encoding)),
    }
}

fn digest_bytes(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, JsErrorBox> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha1" => Ok(sha1::Sha1::digest(data).to_vec()),
        "sha256" => Ok(sha2::Sha256::digest(data).to_vec()),
        "sha384" => Ok(sha2::Sha384::digest(data).to_vec()),
        "sha512" => Ok(sha2::Sha512::digest(data).to_vec()),
        _ => Err(JsErrorBox::generic(format!(
            "Digest method not supported: {algorithm}"
        ))),
    }
}

/// Hash `data` with the named algorithm.
#[op2]
#[buffer]
pub fn op_runbox_digest(
    #[string] algorithm: &str,
    #[buffer] data: &[u8],
) -> Result<Vec<u8>, JsErrorBox> {
    digest_bytes(algorithm, data)
}

fn hmac_bytes(algorithm: &str, key: &[u8], data: &[u8]) -> Result<Vec<u8>, JsErrorBox> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, JsErrorBox> {
        let mut mac = <M as Mac>::new_from_slice(key)
            .map_err(|e| JsErrorBox::generic(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match algorithm.to_ascii_lowercase().as_str() {
        "sha1" => run::<Hmac<sha1::Sha1>>(key, data),
        "sha256" => run::<Hmac<sha2::Sha256>>(key, data),
        "sha384" => run::<Hmac<sha2::Sha384>>(key, data),
        "sha512" => run::<Hmac<sha2::Sha512>>(key, data),
        _ => Err(JsErrorBox::generic(format!(
            "Digest method not supported: {algorithm}"
        ))),
    }
}

/// Keyed hash of `data`.
#[op2]
#[buffer]
pub fn op_runbox_hmac(
    #[string] algorithm: &str,
    #[buffer] key: &[u8],
    #[buffer] data: &[u8],
) -> Result<Vec<u8>, JsErrorBox> {
    hmac_bytes(algorithm, key, data)
}

/// Cryptographically random bytes.
#[op2]
#[buffer]
pub fn op_runbox_random_bytes(#[smi] size: u32) -> Result<Vec<u8>, JsErrorBox> {
    let size = size as usize;
    if size > MAX_RANDOM_BYTES {
        return Err(JsErrorBox::range_error(format!(
            "randomBytes size {size} exceeds maximum of {MAX_RANDOM_BYTES}"
        )));
    }
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Ok(buf)
}

/// A random v4 UUID string.
#[op2]
#[string]
pub fn op_runbox_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

deno_core::extension!(
    runbox_ext,
    ops = [
        op_runbox_log,
        op_runbox_fail,
        op_runbox_timer_wait,
        op_runbox_timer_cancel,
        op_runbox_encode,
        op_runbox_decode,
        op_runbox_digest,
        op_runbox_hmac,
        op_runbox_random_bytes,
        op_runbox_random_uuid
    ],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_carry_level_prefix() {
        let line = format_log_line("error", "bad");
        assert!(line.starts_with('['));
        assert!(line.ends_with("] ERROR: bad"));
        assert!(format_log_line("warn", "careful").ends_with("] WARN: careful"));
        assert!(format_log_line("log", "hi").ends_with("] hi"));
    }

    #[test]
    fn log_timestamp_is_iso_millis_utc() {
        let line = format_log_line("log", "x");
        let ts = &line[1..line.find(']').unwrap()];
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn captured_log_drops_lines_past_cap() {
        let mut log = CapturedLog::new(10);
        log.push("12345".into());
        log.push("1234".into());
        assert!(!log.overflowed());
        log.push("x".into());
        assert!(log.overflowed());
        assert_eq!(log.into_lines(), vec!["12345", "1234"]);
    }

    #[test]
    fn cancel_before_register_suppresses_wait() {
        let mut timers = TimerRegistry::default();
        timers.cancel(7);
        assert!(timers.register(7).is_none());
        assert!(timers.register(8).is_some());
        assert_eq!(timers.pending(), 1);
    }

    #[test]
    fn sha256_digest_matches_known_vector() {
        let out = digest_bytes("sha256", b"abc").unwrap();
        assert_eq!(
            hex::encode(out),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hmac_sha256_matches_rfc4231_case_2() {
        let out = hmac_bytes("sha256", b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(out),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn unknown_digest_is_rejected() {
        assert!(digest_bytes("md4", b"").is_err());
    }
}
