use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::events::EventKind;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook request was rejected. All of these map to a 403.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("header \"x-hub-signature-256\" missing")]
    MissingHeader,

    #[error("malformed signature header: {header}")]
    MalformedHeader { header: String },

    #[error("unsupported signature prefix: {prefix}")]
    UnsupportedPrefix { prefix: String },

    #[error("signature is not hex")]
    UndecodableSignature,

    #[error("header \"x-hub-signature-256\" does not match the body")]
    Mismatch,
}

/// Verifies the `X-Hub-Signature-256` header against the raw request body.
/// The comparison runs in constant time via the mac itself.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    let (prefix, signature) =
        header
            .split_once('=')
            .ok_or_else(|| SignatureError::MalformedHeader {
                header: header.to_owned(),
            })?;
    if !prefix.eq_ignore_ascii_case("sha256") {
        return Err(SignatureError::UnsupportedPrefix {
            prefix: prefix.to_owned(),
        });
    }
    let signature = hex::decode(signature).map_err(|_| SignatureError::UndecodableSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Maps a decoded webhook payload onto an event, or `None` when the payload
/// is none of our business (that is not an error: GitHub delivers whatever
/// the app is subscribed to).
pub fn classify_payload(payload: &Value) -> Option<EventKind> {
    if is_created_pr_comment(payload) {
        return Some(EventKind::PrComment {
            repo: payload["repository"]["full_name"].as_str()?.to_owned(),
            pr: payload["issue"]["number"].as_u64()?,
            comment_id: payload["comment"]["id"].as_u64()?,
            body: payload["comment"]["body"].as_str()?.to_owned(),
        });
    }
    if is_completed_workflow(payload) {
        return Some(EventKind::CheckCompleted {
            repo: payload["repository"]["full_name"].as_str()?.to_owned(),
            commit: payload["workflow_run"]["head_sha"].as_str()?.to_owned(),
            good: payload["workflow_run"]["conclusion"].as_str() == Some("success"),
        });
    }
    if payload["ping"].as_bool() == Some(true) {
        return Some(EventKind::Ping);
    }
    None
}

fn is_created_pr_comment(payload: &Value) -> bool {
    payload["action"].as_str() == Some("created")
        && !payload["issue"]["pull_request"].is_null()
        && !payload["comment"].is_null()
}

fn is_completed_workflow(payload: &Value) -> bool {
    payload["action"].as_str() == Some("completed") && !payload["workflow_run"].is_null()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let body = b"{\"ping\": true}";
        let header = sign("sesame", body);
        assert!(verify_signature("sesame", body, Some(&header)).is_ok());
    }

    #[test]
    fn test_signature_prefix_is_case_insensitive() {
        let body = b"payload";
        let header = sign("sesame", body).replace("sha256", "SHA256");
        assert!(verify_signature("sesame", body, Some(&header)).is_ok());
    }

    #[test]
    fn test_missing_header() {
        assert!(matches!(
            verify_signature("sesame", b"x", None),
            Err(SignatureError::MissingHeader)
        ));
    }

    #[test]
    fn test_malformed_header() {
        assert!(matches!(
            verify_signature("sesame", b"x", Some("garbage")),
            Err(SignatureError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_unsupported_prefix() {
        assert!(matches!(
            verify_signature("sesame", b"x", Some("sha1=abcd")),
            Err(SignatureError::UnsupportedPrefix { .. })
        ));
    }

    #[test]
    fn test_wrong_secret() {
        let body = b"payload";
        let header = sign("other", body);
        assert!(matches!(
            verify_signature("sesame", body, Some(&header)),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn test_tampered_body() {
        let header = sign("sesame", b"original");
        assert!(matches!(
            verify_signature("sesame", b"tampered", Some(&header)),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn test_classify_pr_comment() {
        let payload = json!({
            "action": "created",
            "repository": { "full_name": "acme/widgets" },
            "issue": { "number": 5, "pull_request": {} },
            "comment": { "id": 77, "body": "!qram go", "html_url": "http://x" },
        });
        assert_eq!(
            classify_payload(&payload),
            Some(EventKind::PrComment {
                repo: "acme/widgets".to_owned(),
                pr: 5,
                comment_id: 77,
                body: "!qram go".to_owned(),
            })
        );
    }

    #[test]
    fn test_classify_issue_comment_is_not_ours() {
        // A comment on a plain issue has no pull_request key.
        let payload = json!({
            "action": "created",
            "repository": { "full_name": "acme/widgets" },
            "issue": { "number": 5 },
            "comment": { "id": 77, "body": "hello" },
        });
        assert_eq!(classify_payload(&payload), None);
    }

    #[test]
    fn test_classify_completed_workflow() {
        let payload = json!({
            "action": "completed",
            "repository": { "full_name": "acme/widgets" },
            "workflow_run": {
                "id": 1,
                "head_sha": "0123abc",
                "conclusion": "success",
                "html_url": "http://x",
            },
        });
        assert_eq!(
            classify_payload(&payload),
            Some(EventKind::CheckCompleted {
                repo: "acme/widgets".to_owned(),
                commit: "0123abc".to_owned(),
                good: true,
            })
        );
    }

    #[test]
    fn test_classify_failed_workflow() {
        let payload = json!({
            "action": "completed",
            "repository": { "full_name": "acme/widgets" },
            "workflow_run": { "head_sha": "0123abc", "conclusion": "failure" },
        });
        assert_eq!(
            classify_payload(&payload),
            Some(EventKind::CheckCompleted {
                repo: "acme/widgets".to_owned(),
                commit: "0123abc".to_owned(),
                good: false,
            })
        );
    }

    #[test]
    fn test_classify_ping() {
        assert_eq!(
            classify_payload(&json!({ "ping": true })),
            Some(EventKind::Ping)
        );
    }

    #[test]
    fn test_classify_unrelated_payload() {
        assert_eq!(classify_payload(&json!({ "action": "opened" })), None);
        assert_eq!(classify_payload(&json!({})), None);
    }
}
