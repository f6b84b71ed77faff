//! Plain text output

use pkrguard_core::{AnalysisOutcome, Certification, DiagnosisOutcome, ValidationOutcome};
use pkrguard_detector::DelusionAnalysis;
use pkrguard_validation::OptimizationReport;
use std::io::{self, Write};

fn findings(out: &mut dyn Write, analysis: &DelusionAnalysis) -> io::Result<()> {
    if analysis.is_clean() {
        return writeln!(out, "no delusion patterns found");
    }
    writeln!(
        out,
        "{} finding(s), delusion confidence {:.2}",
        analysis.patterns.len(),
        analysis.confidence_score
    )?;
    for step in &analysis.remediation_plan {
        writeln!(out, "  [{}] {} ({})", step.severity, step.description, step.kind)?;
        for location in &step.locations {
            writeln!(out, "      at {location}")?;
        }
        writeln!(out, "      fix: {}", step.remediation)?;
    }
    Ok(())
}

pub(crate) fn analysis(out: &mut dyn Write, outcome: &AnalysisOutcome) -> io::Result<()> {
    writeln!(
        out,
        "{}  {}",
        outcome.path.display(),
        outcome.analysis.config_hash.short()
    )?;
    if let Some(reason) = &outcome.fallback_reason {
        writeln!(out, "partial textual analysis: {reason}")?;
    }
    findings(out, &outcome.analysis)?;
    for opportunity in &outcome.analysis.learning_opportunities {
        writeln!(
            out,
            "  uncertain: {} (confidence {:.2})",
            opportunity.pattern_id, opportunity.confidence
        )?;
    }
    Ok(())
}

pub(crate) fn validation(out: &mut dyn Write, outcome: &ValidationOutcome) -> io::Result<()> {
    let report = &outcome.report;
    writeln!(out, "configuration {}", report.config_hash.short())?;
    for (dimension, score) in report.dimensions.iter() {
        writeln!(out, "  {dimension:<14} {score:.2}")?;
    }
    writeln!(out, "  {:<14} {:.2}", "overall", report.overall)?;

    if let Some(metrics) = &outcome.metrics {
        writeln!(
            out,
            "build metrics: duration {:.2}, memory {:.2}, cpu {:.2}",
            metrics.duration, metrics.memory, metrics.cpu
        )?;
    }
    for check in outcome.artifacts.iter().filter(|c| !c.matches) {
        match &check.error {
            Some(error) => writeln!(out, "artifact {}: {error}", check.path.display())?,
            None => writeln!(out, "artifact {}: checksum mismatch", check.path.display())?,
        }
    }

    match &outcome.certification {
        Certification::Issued { certificate } => {
            writeln!(out, "certificate {} issued", certificate.id)?;
            writeln!(out, "  expires {}", certificate.expiry.to_rfc3339())?;
            writeln!(out, "  issuer  {}", certificate.issuer)?;
        }
        Certification::Refused {
            overall,
            threshold,
            gap,
            failing_dimensions,
            remediation_hints,
        } => {
            writeln!(
                out,
                "certificate refused: overall {overall:.2}, threshold {threshold:.2}, short by {gap:.2}"
            )?;
            if !failing_dimensions.is_empty() {
                let names: Vec<&str> = failing_dimensions.iter().map(|d| d.as_str()).collect();
                writeln!(out, "  below threshold: {}", names.join(", "))?;
            }
            for hint in remediation_hints {
                writeln!(out, "  - {hint}")?;
            }
        }
    }
    Ok(())
}

pub(crate) fn diagnosis(out: &mut dyn Write, outcome: &DiagnosisOutcome) -> io::Result<()> {
    let d = &outcome.diagnosis;
    writeln!(out, "failure: {} (confidence {:.2})", d.failure_type, d.confidence)?;
    writeln!(out, "root cause: {}", d.root_cause)?;
    if !d.affected_components.is_empty() {
        writeln!(out, "affected: {}", d.affected_components.join(", "))?;
    }
    for evidence in d.evidence.iter().take(5) {
        writeln!(out, "  line {}: {}", evidence.line_number, evidence.line.trim())?;
    }
    for pattern in &d.correlated_patterns {
        writeln!(out, "  correlated: {pattern}")?;
    }
    for recommendation in &d.recommendations {
        writeln!(out, "  - {recommendation}")?;
    }

    if let Some(plan) = &outcome.plan {
        writeln!(out, "plan {} ({}), confidence {:.2}", plan.id, plan.template, plan.confidence)?;
        for step in &plan.steps {
            writeln!(
                out,
                "  {}. {} (timeout {}ms, {} retries)",
                step.id,
                step.action.name(),
                step.timeout_ms,
                step.retries
            )?;
        }
        if !plan.may_run_automatically() {
            writeln!(out, "  needs approval: irreversible steps")?;
        }
    }
    if let Some(reason) = &outcome.escalation {
        writeln!(out, "escalation: {reason}")?;
    }
    Ok(())
}

pub(crate) fn optimization(out: &mut dyn Write, report: &OptimizationReport) -> io::Result<()> {
    writeln!(
        out,
        "configuration {}: performance {:.2}",
        report.config_hash.short(),
        report.performance
    )?;
    if report.hints.is_empty() {
        return writeln!(out, "no performance hints");
    }
    for hint in &report.hints {
        writeln!(out, "  [{}] {}: {}", hint.id, hint.component, hint.message)?;
        writeln!(out, "      {}", hint.recommendation)?;
    }
    Ok(())
}
