//! Minimal SDP surface, spec §6: just the three line kinds this engine
//! consumes/produces. A full SDP parser/printer is an external
//! collaborator (spec §1, out of scope); this module is the narrow
//! stand-in the engine calls internally.

use crate::candidate::{parse_candidate_sdp, Candidate};
use crate::error::AgentError;

pub fn extract_ice_ufrag(sdp: &str) -> Option<&str> {
    find_line_value(sdp, "a=ice-ufrag:")
}

pub fn extract_ice_pwd(sdp: &str) -> Option<&str> {
    find_line_value(sdp, "a=ice-pwd:")
}

fn find_line_value<'a>(sdp: &'a str, prefix: &str) -> Option<&'a str> {
    sdp.lines().find_map(|line| line.trim().strip_prefix(prefix))
}

/// Parses every `a=candidate:` line in `sdp`, dropping (not erroring
/// on) lines `parse_candidate_sdp` reports as ignored.
pub fn extract_candidates(sdp: &str) -> Result<Vec<Candidate>, AgentError> {
    sdp.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("a=candidate:"))
        .filter_map(|line| parse_candidate_sdp(line).transpose())
        .collect()
}

/// Renders `ufrag`/`pwd`/candidate lines for a local description, per
/// spec §6's SDP surface.
pub fn format_description(ufrag: &str, pwd: &str, candidate_lines: &[String]) -> String {
    let mut out = format!("a=ice-ufrag:{ufrag}\r\na=ice-pwd:{pwd}\r\n");
    for line in candidate_lines {
        out.push_str("a=");
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ufrag_and_pwd() {
        let sdp = "v=0\r\na=ice-ufrag:F7gI\r\na=ice-pwd:x9cml/YzichV2+XlhiMu8g\r\n";
        assert_eq!(extract_ice_ufrag(sdp), Some("F7gI"));
        assert_eq!(extract_ice_pwd(sdp), Some("x9cml/YzichV2+XlhiMu8g"));
    }

    #[test]
    fn missing_lines_return_none() {
        assert_eq!(extract_ice_ufrag("v=0\r\n"), None);
    }

    #[test]
    fn extracts_candidates_and_skips_ignored_lines() {
        let sdp = concat!(
            "a=candidate:1 1 UDP 2130706431 10.0.0.1 4000 typ host\r\n",
            "a=candidate:2 2 UDP 2130706431 10.0.0.1 4001 typ host\r\n", // component 2, ignored
            "a=candidate:3 1 TCP 2130706431 10.0.0.1 4002 typ host\r\n", // TCP, ignored
        );
        let candidates = extract_candidates(sdp).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].service, "4000");
    }

    #[test]
    fn format_description_roundtrips_through_extract() {
        let rendered = format_description("ufrag1", "pwd12345678901234567890", &["candidate:1 1 UDP 2130706431 10.0.0.1 4000 typ host".to_string()]);
        assert_eq!(extract_ice_ufrag(&rendered), Some("ufrag1"));
        let candidates = extract_candidates(&rendered).unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
