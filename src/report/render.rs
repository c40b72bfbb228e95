use std::fmt::Write as _;

use super::{JobOutcome, ReportEntry};
use crate::error::Result;
use crate::metrics::AggregateSummary;

/// Plain-text report, one block per job.
pub fn render_text(entries: &[ReportEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "{} [cohort {}] {}", entry.label, entry.cohort, entry.metric);
        match &entry.outcome {
            JobOutcome::Completed(AggregateSummary::Attainment(s)) => {
                let _ = writeln!(out, "  Users:      {}", s.total);
                let _ = writeln!(out, "  Met:        {}", s.met);
                let _ = writeln!(out, "  Not met:    {}", s.not_met);
                match s.proportion {
                    Some(p) => {
                        let _ = writeln!(out, "  Proportion: {p:.4}");
                    }
                    None => {
                        let _ = writeln!(out, "  Proportion: n/a");
                    }
                }
            }
            JobOutcome::Completed(AggregateSummary::Revert(s)) => {
                let _ = writeln!(out, "  Users:      {}", s.total);
                let _ = writeln!(out, "  Editors:    {}", s.editors);
                let _ = writeln!(
                    out,
                    "  Reverted:   {}/{} revisions ({} editors)",
                    s.total_reverted, s.total_revisions, s.reverted_editors
                );
                let _ = writeln!(out, "  Mean rate:  {}", fmt_rate(s.mean_rate));
                let _ = writeln!(out, "  Weighted:   {}", fmt_rate(s.weighted_rate));
            }
            JobOutcome::Failed { error } => {
                let _ = writeln!(out, "  Failed:     {error}");
                continue;
            }
        }
        if let Some(summary) = entry.summary() {
            let _ = write!(out, "  Undefined:  {}", summary.undefined());
            let reasons = summary.undefined_reasons();
            if !reasons.is_empty() {
                let parts: Vec<String> = reasons.iter().map(|(k, v)| format!("{k}={v}")).collect();
                let _ = write!(out, " ({})", parts.join(", "));
            }
            out.push('\n');
        }
    }
    out
}

pub fn render_json(entries: &[ReportEntry]) -> Result<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}

/// One CSV row per job; fields that do not apply to a metric are left empty.
pub fn render_csv(entries: &[ReportEntry]) -> String {
    let mut out = String::new();
    out.push_str("label,cohort,metric,status,total,undefined,met,not_met,proportion,editors,mean_rate,weighted_rate,error\n");
    for entry in entries {
        let prefix = format!(
            "{},{},{}",
            csv_escape(&entry.label),
            csv_escape(&entry.cohort),
            csv_escape(&entry.metric)
        );
        let row = match &entry.outcome {
            JobOutcome::Completed(AggregateSummary::Attainment(s)) => format!(
                "completed,{},{},{},{},{},,,,",
                s.total,
                s.undefined,
                s.met,
                s.not_met,
                opt_f64(s.proportion),
            ),
            JobOutcome::Completed(AggregateSummary::Revert(s)) => format!(
                "completed,{},{},,,,{},{},{},",
                s.total,
                s.undefined,
                s.editors,
                opt_f64(s.mean_rate),
                opt_f64(s.weighted_rate),
            ),
            JobOutcome::Failed { error } => {
                format!("failed,,,,,,,,,{}", csv_escape(error))
            }
        };
        let _ = writeln!(out, "{prefix},{row}");
    }
    out
}

pub(crate) fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn opt_f64(v: Option<f64>) -> String {
    v.map_or(String::new(), |v| v.to_string())
}

fn fmt_rate(v: Option<f64>) -> String {
    v.map_or("n/a".to_string(), |v| format!("{v:.4}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AttainmentSummary;
    use std::collections::BTreeMap;

    fn entries() -> Vec<ReportEntry> {
        let mut reasons = BTreeMap::new();
        reasons.insert("no_registration".to_string(), 1);
        vec![
            ReportEntry {
                label: "onboarding".into(),
                cohort: "e3_ob2b".into(),
                metric: "threshold(t=1440, n=1)".into(),
                outcome: JobOutcome::Completed(AggregateSummary::Attainment(
                    AttainmentSummary {
                        total: 3,
                        met: 1,
                        not_met: 1,
                        undefined: 1,
                        proportion: Some(0.5),
                        undefined_reasons: reasons,
                    },
                )),
            },
            ReportEntry {
                label: "missing".into(),
                cohort: "nope".into(),
                metric: "survival(t=1440)".into(),
                outcome: JobOutcome::Failed {
                    error: "Not found: cohort 'nope'".into(),
                },
            },
        ]
    }

    #[test]
    fn test_render_text() {
        let text = render_text(&entries());
        assert!(text.contains("onboarding [cohort e3_ob2b] threshold(t=1440, n=1)"));
        assert!(text.contains("Proportion: 0.5000"));
        assert!(text.contains("Undefined:  1 (no_registration=1)"));
        assert!(text.contains("Failed:     Not found: cohort 'nope'"));
    }

    #[test]
    fn test_render_json() {
        let json = render_json(&entries()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["outcome"]["completed"]["kind"], "attainment");
        assert_eq!(parsed[0]["outcome"]["completed"]["proportion"], 0.5);
        assert_eq!(parsed[1]["outcome"]["failed"]["error"], "Not found: cohort 'nope'");
    }

    #[test]
    fn test_render_csv() {
        let csv = render_csv(&entries());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[1],
            "onboarding,e3_ob2b,\"threshold(t=1440, n=1)\",completed,3,1,1,1,0.5,,,,"
        );
        assert!(lines[2].starts_with("missing,nope,survival(t=1440),failed,"));
        // every row has the header's column count (no embedded commas in row 2)
        assert_eq!(lines[2].split(',').count(), lines[0].split(',').count());
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
