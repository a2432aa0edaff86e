use reqwest::header::{ACCEPT, REFERER, USER_AGENT};
use snapcrawler::network::identity::{build_headers, UserAgentPool};

#[test]
fn test_pool_picks_from_configured_agents() {
    let agents = vec!["AgentA/1.0".to_string(), "AgentB/2.0".to_string()];
    let pool = UserAgentPool::new(&agents);
    assert_eq!(pool.len(), 2);

    for _ in 0..50 {
        let ua = pool.pick();
        assert!(agents.iter().any(|a| a == ua));
    }
}

#[test]
fn test_headers_carry_agent_and_referer() {
    let headers = build_headers("AgentA/1.0", Some("https://example.com/")).unwrap();

    assert_eq!(headers.get(USER_AGENT).unwrap(), "AgentA/1.0");
    assert_eq!(headers.get(REFERER).unwrap(), "https://example.com/");
    // * Images are asked for first
    assert!(headers
        .get(ACCEPT)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("image/"));
}

#[test]
fn test_headers_without_referer() {
    let headers = build_headers("AgentA/1.0", None).unwrap();
    assert!(headers.get(REFERER).is_none());
}
