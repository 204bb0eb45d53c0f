//! Composite job keys: `J_<id>_<host>_<port>`.
//!
//! The id is what the engine cares about; host and port let a client route
//! follow-up commands back to the issuing server. A bare decimal id is
//! also accepted on decode.

pub fn make_job_key(job_id: u32, host: &str, port: u16) -> String {
    format!("J_{}_{}_{}", job_id, host, port)
}

/// Decode a job key into its job id. Returns `None` when the key has
/// neither the composite shape nor a plain decimal form; an id of zero is
/// returned as-is and rejected by the caller.
pub fn decode_job_key(key: &str) -> Option<u32> {
    if let Some(rest) = key.strip_prefix("J_") {
        let id_part = rest.split('_').next()?;
        return id_part.parse().ok();
    }
    key.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = make_job_key(125, "grid.example.net", 9100);
        assert_eq!(key, "J_125_grid.example.net_9100");
        assert_eq!(decode_job_key(&key), Some(125));
    }

    #[test]
    fn test_bare_id() {
        assert_eq!(decode_job_key("42"), Some(42));
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(decode_job_key(""), None);
        assert_eq!(decode_job_key("J_x_host_1"), None);
        assert_eq!(decode_job_key("not-a-key"), None);
    }
}
