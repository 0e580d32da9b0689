use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::{distributions::Alphanumeric, Rng};
use webrtc::{ice_transport::ice_server::RTCIceServer, peer_connection::configuration::RTCConfiguration};

/// Lock a std mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routing key of a session id as received on the wire: the trimmed id,
/// otherwise untouched. Returns `None` for a blank id.
pub fn session_key(raw: &str) -> Option<String> {
    let key = raw.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Short form of a session id as shared by the production links.
///
/// A long-form id `prefix:token` is shortened to its second segment; an id
/// without one is kept. Returns `None` when nothing usable is left.
pub fn normalize_session_id(raw: &str) -> Option<String> {
    let short = match raw.split(':').nth(1) {
        Some(token) if !token.is_empty() => token,
        _ => raw,
    };
    session_key(short)
}

/// Platform-prefixed stream handle, e.g. `yt-lq3k1x0a-7fq2`.
pub fn stream_handle(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}-{}", prefix, to_base36(millis), suffix)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

pub fn rtc_config() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:stun1.l.google.com:19302".to_owned(),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form_ids_shorten_to_the_second_segment() {
        assert_eq!(normalize_session_id("prostream:abc").as_deref(), Some("abc"));
        assert_eq!(normalize_session_id("a:b:c").as_deref(), Some("b"));
        assert_eq!(normalize_session_id(" abc ").as_deref(), Some("abc"));
        assert_eq!(normalize_session_id("abc:").as_deref(), Some("abc:"));
        assert_eq!(normalize_session_id("   "), None);
    }

    #[test]
    fn session_keys_are_only_trimmed() {
        assert_eq!(session_key(" alpha:abc ").as_deref(), Some("alpha:abc"));
        assert_eq!(session_key("a:b:c").as_deref(), Some("a:b:c"));
        assert_eq!(session_key(""), None);
    }

    #[test]
    fn stream_handles_carry_prefix_and_differ() {
        let a = stream_handle("yt");
        let b = stream_handle("yt");
        assert!(a.starts_with("yt-"));
        assert_ne!(a, b);
    }

    #[test]
    fn base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
