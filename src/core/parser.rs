//! Parsers for the text printed by the cluster tools.
//!
//! Each function documents the input shape it accepts and fails with a
//! [`ParseError`] when the output does not match. None of them touch the
//! process table: callers fetch the text through a `ClusterSource`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::core::vm::{DefaultPlacement, ResourceStatus};
use crate::errors::ParseError;

static LOCATE_NODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\s*(\S+)").expect("static regex"));

static NOT_RUNNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bis\s+NOT\s+running\b").expect("static regex"));

static PLACEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(?:^|\s)(prefer|pin)-\S+\s+(\S+)(?:\s+\S+)?\s+inf:\s*(\S+)").expect("static regex")
});

static ONLINE_NODES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\s*Online:\s*\[\s*([\w\-\s]*?)\s*\]").expect("static regex"));

static XML_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).expect("static regex"));

static RESOURCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<resource\b([^>]*?)(/?)>").expect("static regex"));

static NODE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<node\b([^>]*?)/?>").expect("static regex"));

/// `vm-mgr list`: one VM name per line.
///
/// Blank lines are dropped. A line with embedded whitespace or a repeated
/// name means we are not looking at a VM list, so the whole parse fails.
pub fn parse_vm_list(output: &str) -> Result<Vec<String>, ParseError> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();

    for (idx, line) in output.lines().enumerate() {
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        if name.split_whitespace().nth(1).is_some() {
            return Err(ParseError::MalformedLine {
                line: idx + 1,
                content: line.to_string(),
            });
        }
        if !seen.insert(name.to_string()) {
            return Err(ParseError::Duplicate(name.to_string()));
        }
        names.push(name.to_string());
    }

    Ok(names)
}

/// `crm resource locate <vm>`: `resource vm1 is running on: node2`.
///
/// Returns `Ok(None)` for `resource vm1 is NOT running`.
pub fn parse_locate(output: &str) -> Result<Option<String>, ParseError> {
    if let Some(caps) = LOCATE_NODE.captures(output) {
        return Ok(Some(caps[1].to_string()));
    }
    if NOT_RUNNING.is_match(output) {
        return Ok(None);
    }
    Err(ParseError::MissingField { expected: ": <node>" })
}

/// `crm configure show`: placement constraints such as
///
/// ```text
/// location pin-vm1 vm1 role=Started inf: node1
/// location prefer-vm2 vm2 role=Started inf: node3
/// ```
///
/// Later lines override earlier ones for the same resource. Constraint ids
/// must start with the tag, so `cli-prefer-*` entries left behind by
/// `crm resource move` are ignored.
pub fn parse_placements(config: &str) -> HashMap<String, DefaultPlacement> {
    let mut placements = HashMap::new();
    for caps in PLACEMENT.captures_iter(config) {
        let node = caps[3].to_string();
        let placement = match &caps[1] {
            "pin" => DefaultPlacement::Pin(node),
            _ => DefaultPlacement::Prefer(node),
        };
        placements.insert(caps[2].to_string(), placement);
    }
    placements
}

/// `crm status --exclude=all --include=nodes`: `* Online: [ node1 node2 ]`.
///
/// No `Online:` line means no node is online.
pub fn parse_online_nodes(output: &str) -> Vec<String> {
    ONLINE_NODES
        .captures(output)
        .map(|caps| caps[1].split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// `vm-mgr list_snapshots -n <vm>`: a Python-style list, `['snap1', 'snap2']`.
pub fn parse_snapshot_list(output: &str) -> Vec<String> {
    output
        .trim()
        .replace(['[', ']', '\'', '"'], "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `crm_mon --output-as xml`: finds `<resource id="<vm>" role=... >` and the
/// `<node name=...>` children listing where it runs.
pub fn parse_resource_status(xml: &str, resource_id: &str) -> Result<ResourceStatus, ParseError> {
    for open in RESOURCE_OPEN.captures_iter(xml) {
        let attrs = attributes(&open[1]);
        if attrs.get("id").map(String::as_str) != Some(resource_id) {
            continue;
        }

        let role = attrs
            .get("role")
            .cloned()
            .ok_or(ParseError::MissingField { expected: "role" })?;

        let mut nodes = Vec::new();
        let self_closing = &open[2] == "/";
        if !self_closing {
            // whole match ends right after '>'
            let body_start = open.get(0).map(|m| m.end()).unwrap_or(0);
            let body = &xml[body_start..];
            let body = body.find("</resource>").map(|end| &body[..end]).unwrap_or(body);
            for node in NODE_TAG.captures_iter(body) {
                if let Some(name) = attributes(&node[1]).remove("name") {
                    nodes.push(name);
                }
            }
        }

        return Ok(ResourceStatus {
            role,
            active: attrs.get("active").map(|v| v == "true").unwrap_or(false),
            failed: attrs.get("failed").map(|v| v == "true").unwrap_or(false),
            nodes,
        });
    }

    Err(ParseError::ResourceNotFound(resource_id.to_string()))
}

fn attributes(tag_body: &str) -> HashMap<String, String> {
    XML_ATTRIBUTE
        .captures_iter(tag_body)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}
