//! Text generation for findings, final reports and agent input.

use crate::models::{Modality, RiskLevel};
use serde::{Deserialize, Serialize};

/// Rendered when a modality was not part of the submission.
pub const MODALITY_NOT_PROVIDED: &str = "Not provided for this modality.";

/// Risk signal added to reports built without the tool-calling protocol.
pub const PROTOCOL_NOT_FOLLOWED_SIGNAL: &str =
    "The model did not follow the tool-calling protocol; this report was built from its free-text reply.";

/// Structured result of one modality analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFinding {
    /// Scene or source judgment (real photo, screen capture, synthetic voice, ...).
    #[serde(default)]
    pub scene_judgment: String,
    /// Objective content: text, URLs, amounts, contacts, institutions.
    #[serde(default)]
    pub key_content: String,
    /// Anomalies, listed without a verdict.
    #[serde(default)]
    pub suspicious_points: Vec<String>,
}

/// Structured arguments of the final-report tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalReportPayload {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub text_finding: String,
    #[serde(default)]
    pub image_finding: String,
    #[serde(default)]
    pub video_finding: String,
    #[serde(default)]
    pub audio_finding: String,
    #[serde(default)]
    pub risk_signals: Vec<String>,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub risk_reason: String,
    #[serde(default)]
    pub next_actions: Vec<String>,
}

impl FinalReportPayload {
    /// Risk level, with anything unrecognized treated as medium.
    pub fn risk(&self) -> RiskLevel {
        RiskLevel::parse_or_medium(&self.risk_level)
    }
}

/// Render a modality finding as three titled sections.
pub fn format_analysis_finding(finding: &AnalysisFinding) -> String {
    let mut output = String::new();

    output.push_str("[Scene / source judgment]\n");
    output.push_str(finding.scene_judgment.trim());
    output.push_str("\n\n[Key content]\n");
    output.push_str(finding.key_content.trim());
    output.push_str("\n\n[Suspicious points]\n");

    let points: Vec<&str> = non_empty(&finding.suspicious_points).collect();
    if points.is_empty() {
        output.push_str("- No obvious anomalies observed\n");
    } else {
        for (i, point) in points.iter().enumerate() {
            output.push_str(&format!("{}. {}\n", i + 1, point));
        }
    }

    output
}

/// Render the five-section final report.
pub fn format_final_report(payload: &FinalReportPayload) -> String {
    let mut report = String::new();

    report.push_str("1. Summary\n");
    report.push_str(payload.summary.trim());

    report.push_str("\n\n2. Key findings by modality\n");
    report.push_str(&format!("- Text: {}\n", payload.text_finding.trim()));
    report.push_str(&format!("- Image: {}\n", payload.image_finding.trim()));
    report.push_str(&format!("- Video: {}\n", payload.video_finding.trim()));
    report.push_str(&format!("- Audio: {}", payload.audio_finding.trim()));

    report.push_str("\n\n3. Risk signals\n");
    push_bullets(
        &mut report,
        &payload.risk_signals,
        "No explicit risk signal identified",
    );

    report.push_str("\n4. Preliminary risk level and reason\n");
    report.push_str(&format!("- Risk level: {}\n", payload.risk()));
    report.push_str(&format!("- Reason: {}", payload.risk_reason.trim()));

    report.push_str("\n\n5. Recommended next steps\n");
    push_bullets(
        &mut report,
        &payload.next_actions,
        "Collect more context and review again",
    );

    report.trim().to_string()
}

/// Build the degraded report used when the model answered in free text.
pub fn fallback_report_payload(free_text: &str) -> FinalReportPayload {
    let text = free_text.trim();
    let summary = if text.is_empty() {
        "The model returned no content.".to_string()
    } else {
        text.to_string()
    };

    FinalReportPayload {
        summary,
        text_finding: "See summary".to_string(),
        image_finding: "See summary".to_string(),
        video_finding: "See summary".to_string(),
        audio_finding: "See summary".to_string(),
        risk_signals: vec![PROTOCOL_NOT_FOLLOWED_SIGNAL.to_string()],
        risk_level: RiskLevel::Medium.to_string(),
        risk_reason: "Structured assessment unavailable; defaulting to medium risk.".to_string(),
        next_actions: vec!["Have an analyst review the case manually".to_string()],
    }
}

/// Render a batch of per-item findings for the reasoning model.
pub fn format_modality_batch(modality: Modality, results: &[String]) -> String {
    if results.is_empty() {
        return format!(
            "{} analysis failed: no result returned",
            modality.label()
        );
    }

    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{} #{}]\n{}", modality.label(), i + 1, r.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Per-modality summaries assembled before the protocol loop starts.
#[derive(Debug, Clone)]
pub struct ModalitySummaries {
    pub text: String,
    pub image: String,
    pub video: String,
    pub audio: String,
}

impl ModalitySummaries {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
            image: MODALITY_NOT_PROVIDED.to_string(),
            video: MODALITY_NOT_PROVIDED.to_string(),
            audio: MODALITY_NOT_PROVIDED.to_string(),
        }
    }

    /// Input message for the reasoning model.
    pub fn to_agent_input(&self) -> String {
        let text = if self.text.is_empty() {
            "No text description provided"
        } else {
            self.text.as_str()
        };

        format!(
            "[User text]\n{}\n\n[Image sub-agent results]\n{}\n\n[Video sub-agent results]\n{}\n\n[Audio sub-agent results]\n{}",
            text, self.image, self.video, self.audio
        )
    }
}

fn non_empty(items: &[String]) -> impl Iterator<Item = &str> {
    items.iter().map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn push_bullets(out: &mut String, items: &[String], empty_line: &str) {
    let mut any = false;
    for item in non_empty(items) {
        out.push_str(&format!("- {}\n", item));
        any = true;
    }
    if !any {
        out.push_str(&format!("- {}\n", empty_line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> FinalReportPayload {
        FinalReportPayload {
            summary: "Likely investment scam".to_string(),
            text_finding: "promises guaranteed returns".to_string(),
            image_finding: "fake trading dashboard".to_string(),
            video_finding: "none".to_string(),
            audio_finding: "none".to_string(),
            risk_signals: vec!["guaranteed profit".to_string(), "  ".to_string()],
            risk_level: "高".to_string(),
            risk_reason: "classic pattern".to_string(),
            next_actions: vec![],
        }
    }

    #[test]
    fn test_final_report_has_five_sections() {
        let report = format_final_report(&sample_payload());

        for header in [
            "1. Summary",
            "2. Key findings by modality",
            "3. Risk signals",
            "4. Preliminary risk level and reason",
            "5. Recommended next steps",
        ] {
            assert!(report.contains(header), "missing {}", header);
        }
        assert!(report.contains("- Risk level: high"));
        assert!(report.contains("- guaranteed profit"));
        assert!(report.contains("Collect more context and review again"));
        assert!(!report.contains("-   \n"));
    }

    #[test]
    fn test_invalid_risk_level_becomes_medium() {
        let payload = FinalReportPayload {
            risk_level: "extreme".to_string(),
            ..sample_payload()
        };
        assert_eq!(payload.risk(), RiskLevel::Medium);
        assert!(format_final_report(&payload).contains("- Risk level: medium"));
    }

    #[test]
    fn test_analysis_finding_format() {
        let finding = AnalysisFinding {
            scene_judgment: "Screen capture of a betting app".to_string(),
            key_content: "URL: bet.example".to_string(),
            suspicious_points: vec!["countdown timer".to_string(), "bonus popup".to_string()],
        };
        let text = format_analysis_finding(&finding);
        assert!(text.starts_with("[Scene / source judgment]\nScreen capture"));
        assert!(text.contains("1. countdown timer\n2. bonus popup"));

        let empty = format_analysis_finding(&AnalysisFinding::default());
        assert!(empty.contains("No obvious anomalies observed"));
    }

    #[test]
    fn test_fallback_report_carries_protocol_signal() {
        let payload = fallback_report_payload("free text verdict");
        let report = format_final_report(&payload);
        assert!(report.contains("free text verdict"));
        assert!(report.contains(PROTOCOL_NOT_FOLLOWED_SIGNAL));
        assert_eq!(payload.risk(), RiskLevel::Medium);

        let empty = fallback_report_payload("   ");
        assert_eq!(empty.summary, "The model returned no content.");
    }

    #[test]
    fn test_modality_batch_format() {
        let rendered = format_modality_batch(
            Modality::Image,
            &["first".to_string(), " second ".to_string()],
        );
        assert_eq!(rendered, "[Image #1]\nfirst\n\n[Image #2]\nsecond");
        assert_eq!(
            format_modality_batch(Modality::Audio, &[]),
            "Audio analysis failed: no result returned"
        );
    }

    #[test]
    fn test_agent_input_defaults() {
        let summaries = ModalitySummaries::new("  ");
        let input = summaries.to_agent_input();
        assert!(input.contains("No text description provided"));
        assert_eq!(input.matches(MODALITY_NOT_PROVIDED).count(), 3);
    }
}
