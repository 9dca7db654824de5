use std::time::Duration;

use url::Url;

/// `Disallow` prefixes that apply to our user agent (or `*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    pub disallow: Vec<String>,
    pub allow: Vec<String>,
}

impl RobotsRules {
    /// Longest matching rule wins; `Allow` wins ties.
    pub fn is_allowed(&self, path: &str) -> bool {
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|rule| !rule.is_empty() && path.starts_with(rule.as_str()))
                .map(String::len)
                .max()
        };
        match (longest(&self.allow), longest(&self.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }
}

pub fn parse(text: &str, user_agent: &str) -> RobotsRules {
    let agent = user_agent
        .split('/')
        .next()
        .unwrap_or(user_agent)
        .to_ascii_lowercase();

    let mut specific = RobotsRules::default();
    let mut wildcard = RobotsRules::default();
    let mut saw_specific = false;

    let mut group_agents: Vec<String> = Vec::new();
    let mut in_rules = false;

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                if in_rules {
                    group_agents.clear();
                    in_rules = false;
                }
                group_agents.push(value.to_ascii_lowercase());
            }
            "allow" | "disallow" => {
                in_rules = true;
                let targets_us = group_agents
                    .iter()
                    .any(|a| !a.is_empty() && a != "*" && agent.contains(a.as_str()));
                let targets_all = group_agents.iter().any(|a| a == "*");
                let bucket = if targets_us {
                    saw_specific = true;
                    &mut specific
                } else if targets_all {
                    &mut wildcard
                } else {
                    continue;
                };
                let list = if field == "allow" {
                    &mut bucket.allow
                } else {
                    &mut bucket.disallow
                };
                if !value.is_empty() {
                    list.push(value.to_owned());
                }
            }
            _ => {}
        }
    }

    if saw_specific { specific } else { wildcard }
}

/// Fetches `robots.txt` for `url` and logs when the path is disallowed. The
/// result never blocks the pipeline.
pub async fn log_policy(client: &reqwest::Client, url: &Url, user_agent: &str) -> Option<bool> {
    let mut robots_url = url.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    let response = match client
        .get(robots_url.clone())
        .timeout(Duration::from_secs(3))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            tracing::debug!(url = %robots_url, status = %response.status(), "no robots.txt");
            return None;
        }
        Err(err) => {
            tracing::debug!(url = %robots_url, %err, "robots.txt fetch failed");
            return None;
        }
    };

    let text = response.text().await.ok()?;
    let allowed = parse(&text, user_agent).is_allowed(url.path());
    if !allowed {
        tracing::warn!(
            url = %url,
            "robots.txt disallows this path; continuing (policy is log-only)"
        );
    }
    Some(allowed)
}
