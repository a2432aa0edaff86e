use crate::config::constants::FALLBACK_USER_AGENT;
use crate::network::errors::NetworkError;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};

// * Accept header advertising image types first
const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

// * UserAgentPool hands out a uniformly random User-Agent per request.
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    // * Blank entries are dropped; an empty pool falls back to a single desktop UA.
    pub fn new(agents: &[String]) -> Self {
        let mut agents: Vec<String> = agents
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if agents.is_empty() {
            agents.push(FALLBACK_USER_AGENT.to_string());
        }
        Self { agents }
    }

    pub fn pick(&self) -> &str {
        self.agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(FALLBACK_USER_AGENT)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

// * Builds the request header set for one image fetch.
pub fn build_headers(user_agent: &str, referer: Option<&str>) -> Result<HeaderMap, NetworkError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).map_err(|_| NetworkError::InvalidHeader("User-Agent"))?,
    );
    if let Some(referer) = referer {
        headers.insert(
            REFERER,
            HeaderValue::from_str(referer).map_err(|_| NetworkError::InvalidHeader("Referer"))?,
        );
    }
    headers.insert(ACCEPT, HeaderValue::from_static(IMAGE_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    Ok(headers)
}
