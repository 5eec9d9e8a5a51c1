//! Typed ID definitions.

use crate::define_id;

// An orchestration session: the scope of one event stream and one run state.
define_id!(SessionId, "sess");

// One accepted launch of the pool scheduler inside a session.
define_id!(JobId, "job");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_session_id_prefix() {
        let id = SessionId::new();
        assert!(id.to_string().starts_with("sess_"));
    }

    #[test]
    fn test_job_id_rejects_session_prefix() {
        let session = SessionId::new().to_string();
        let err = session.parse::<JobId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let err = "sess01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<SessionId>().unwrap_err();
        assert_eq!(err, crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        assert_eq!("".parse::<JobId>().unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let err = "job_not-a-ulid".parse::<JobId>().unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_uses_string_form() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = SessionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SessionId::new();
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = s.parse::<SessionId>();
        }
    }
}
