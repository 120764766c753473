use super::products::Operation;

/// Where a candidate list came from, in order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateSource {
    Override,
    Discovered,
    Fallback,
}

/// Ordered upstream tool names to try; the order is the retry order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ToolCandidates {
    pub source: CandidateSource,
    pub names: Vec<String>,
}

pub(crate) fn resolve_candidates(
    op: Operation,
    discovered: Option<&[String]>,
    override_name: Option<&str>,
    fallback: &[String],
) -> ToolCandidates {
    if let Some(name) = override_name.map(str::trim).filter(|s| !s.is_empty()) {
        return ToolCandidates {
            source: CandidateSource::Override,
            names: vec![name.to_string()],
        };
    }

    if let Some(discovered) = discovered.filter(|d| !d.is_empty()) {
        let filtered: Vec<String> = discovered
            .iter()
            .filter(|n| matches_operation(op, n))
            .cloned()
            .collect();
        // The filter is advisory: when nothing matches, try every discovered name.
        let names = if filtered.is_empty() {
            discovered.to_vec()
        } else {
            filtered
        };
        return ToolCandidates {
            source: CandidateSource::Discovered,
            names,
        };
    }

    ToolCandidates {
        source: CandidateSource::Fallback,
        names: fallback.to_vec(),
    }
}

fn ends_with_any(name: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|s| name.ends_with(s))
}

fn matches_operation(op: Operation, name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    match op {
        Operation::Submit => {
            ends_with_any(
                &name,
                &["submit", "edit", "enqueue", "queue", "run", "process"],
            ) && !ends_with_any(&name, &["status", "result", "get"])
        }
        Operation::Status => ends_with_any(&name, &["status", "poll"]),
        Operation::Result => ends_with_any(&name, &["result", "get"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(list: &[&str]) -> Vec<String> {
        list.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn discovered_names_are_filtered_per_operation() {
        let discovered = s(&["foo_submit", "foo_status", "foo_result", "describe"]);
        let fallback = s(&["fallback"]);

        let submit = resolve_candidates(Operation::Submit, Some(discovered.as_slice()), None, &fallback);
        assert_eq!(submit.source, CandidateSource::Discovered);
        assert_eq!(submit.names, s(&["foo_submit"]));

        let status = resolve_candidates(Operation::Status, Some(discovered.as_slice()), None, &fallback);
        assert_eq!(status.names, s(&["foo_status"]));

        let result = resolve_candidates(Operation::Result, Some(discovered.as_slice()), None, &fallback);
        assert_eq!(result.names, s(&["foo_result"]));
    }

    #[test]
    fn submit_filter_keeps_order_and_excludes_getters() {
        let discovered = s(&[
            "image_edit",
            "job_get",
            "Queue",
            "run",
            "process_status",
            "enqueue",
        ]);
        let got = resolve_candidates(Operation::Submit, Some(discovered.as_slice()), None, &[]);
        assert_eq!(got.names, s(&["image_edit", "Queue", "run", "enqueue"]));

        let status = resolve_candidates(Operation::Status, Some(s(&["job_poll"]).as_slice()), None, &[]);
        assert_eq!(status.names, s(&["job_poll"]));

        let result = resolve_candidates(Operation::Result, Some(discovered.as_slice()), None, &[]);
        assert_eq!(result.names, s(&["job_get"]));
    }

    #[test]
    fn empty_filter_result_falls_back_to_all_discovered_names() {
        let discovered = s(&["alpha", "beta"]);
        let got = resolve_candidates(Operation::Status, Some(discovered.as_slice()), None, &s(&["x"]));
        assert_eq!(got.source, CandidateSource::Discovered);
        assert_eq!(got.names, discovered);
    }

    #[test]
    fn failed_or_empty_discovery_uses_static_fallback_verbatim() {
        let fallback = s(&[
            "nano_banana_edit_submit",
            "edit_submit",
            "submit",
            "run",
            "process",
        ]);
        let none = resolve_candidates(Operation::Submit, None, None, &fallback);
        assert_eq!(none.source, CandidateSource::Fallback);
        assert_eq!(none.names, fallback);

        let empty = resolve_candidates(Operation::Submit, Some(&[][..]), None, &fallback);
        assert_eq!(empty.source, CandidateSource::Fallback);
        assert_eq!(empty.names, fallback);
    }

    #[test]
    fn override_wins_regardless_of_discovery() {
        let discovered = s(&["foo_submit"]);
        let got = resolve_candidates(Operation::Submit, Some(discovered.as_slice()), Some("bar"), &[]);
        assert_eq!(got.source, CandidateSource::Override);
        assert_eq!(got.names, s(&["bar"]));

        let blank = resolve_candidates(Operation::Submit, Some(discovered.as_slice()), Some("  "), &[]);
        assert_eq!(blank.source, CandidateSource::Discovered);
    }
}
