use regex::Regex;
use std::{net::IpAddr, sync::LazyLock};
use tproxy_controller_core::{FirewallRule, RuleTag, StoreError};

/// Matches a numbered `REDIRECT` row of `iptables -L -n --line-numbers`:
///
/// ```text
/// num  target     prot opt source               destination
/// 1    REDIRECT   tcp  --  10.1.0.7             0.0.0.0/0            tcp dpt:443 /* tproxy-pod-a */ redir ports 8080
/// ```
///
/// The `opt` column is blank in `ip6tables` listings.
static REDIRECT_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^\s*(?P<num>\d+)\s+REDIRECT\s+\S+\s+(?:(?:--|-f|!f)\s+)?",
        r"(?P<source>\S+)\s+\S+(?P<rest>.*)$",
    ))
    .expect("redirect row pattern must compile")
});

static DPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdpt:(\d+)").expect("dport pattern must compile"));

/// Extracts the rules carrying `tag` from a chain listing, in table order.
///
/// A row matches only if its comment is exactly the tag, so one workload's tag never matches
/// another tag that it happens to prefix.
pub fn parse_listing(listing: &str, tag: &RuleTag) -> Result<Vec<FirewallRule>, StoreError> {
    let comment = format!("/* {tag} */");
    let mut rules = Vec::new();
    for line in listing.lines() {
        let Some(row) = REDIRECT_ROW.captures(line) else {
            continue;
        };
        if !row["rest"].contains(&comment) {
            continue;
        }

        let num = &row["num"];
        let position = num.parse::<u32>().map_err(|source| StoreError::Position {
            text: num.to_string(),
            source,
        })?;
        let source = row["source"]
            .split('/')
            .next()
            .and_then(|s| s.parse::<IpAddr>().ok());
        let dport = DPORT
            .captures(&row["rest"])
            .and_then(|c| c[1].parse::<u16>().ok());

        rules.push(FirewallRule {
            position,
            tag: tag.clone(),
            source,
            dport,
        });
    }
    Ok(rules)
}
