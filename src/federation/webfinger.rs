//! WebFinger protocol implementation
//!
//! Lets remote servers discover the service actor from `acct:user@domain`.

use serde::{Deserialize, Serialize};

use crate::config::ServiceActor;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Whether `resource` (`acct:user@domain`) names `actor`
///
/// Username and domain compare case-insensitively; the `acct:` scheme is
/// required.
pub fn resource_matches(resource: &str, actor: &ServiceActor) -> bool {
    let Some(account) = resource.strip_prefix("acct:") else {
        return false;
    };
    let Some((username, domain)) = account.split_once('@') else {
        return false;
    };

    username.eq_ignore_ascii_case(&actor.username) && domain.eq_ignore_ascii_case(&actor.domain)
}

/// Generate WebFinger response for the service actor.
pub fn generate_webfinger_response(actor: &ServiceActor) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}", actor.account()),
        aliases: Some(vec![actor.id.clone()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some("application/activity+json".to_string()),
            href: Some(actor.id.clone()),
        }],
    }
}
