//! Terminal rendering for plans, progress and reports.

use crate::commands::OutputFormat;
use console::style;
use conduit_core::events::{OutputStream, RunEvent};
use conduit_core::run::{JobState, RunReport, RunStatus};
use conduit_scheduler::PipelineDag;
use tokio::sync::mpsc;

/// Print live progress until the event stream closes.
pub async fn print_progress(mut events: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = progress_line(&event) {
            println!("{}", line);
        }
    }
}

fn progress_line(event: &RunEvent) -> Option<String> {
    let line = match event {
        RunEvent::RunStarted { pipeline, jobs, run_id } => format!(
            "{} Running {} ({} jobs) {}",
            style("▶").cyan().bold(),
            style(pipeline).bold(),
            jobs,
            style(run_id).dim()
        ),
        RunEvent::JobStarted { job } => format!("{} {}", style("━━▶").cyan(), style(job).bold()),
        RunEvent::JobFinished { job, state, reason, duration_ms } => {
            let elapsed = duration_ms.map(format_duration).unwrap_or_default();
            match state {
                JobState::Succeeded => format!("{} {} {}", style("✓").green(), job, style(elapsed).dim()),
                _ => format!(
                    "{} {} {}",
                    style("✗").red(),
                    job,
                    style(reason.as_deref().unwrap_or("failed")).red()
                ),
            }
        }
        RunEvent::JobSkipped { job, reason } => {
            format!("{} {} {}", style("-").dim(), style(job).dim(), style(reason).dim())
        }
        RunEvent::StepOutput { job, stream, line, .. } => {
            let prefix = style(format!("  [{}]", job)).dim();
            match stream {
                OutputStream::Stdout => format!("{} {}", prefix, line),
                OutputStream::Stderr => format!("{} {}", prefix, style(line).yellow()),
            }
        }
        RunEvent::JobReady { .. } | RunEvent::RunCompleted { .. } => return None,
    };
    Some(line)
}

/// Print the final report.
pub fn print_report(report: &RunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Table => print!("{}", render_table(report)),
    }
    Ok(())
}

fn render_table(report: &RunReport) -> String {
    let rows: Vec<[String; 5]> = report
        .jobs
        .iter()
        .map(|job| {
            [
                job.key().to_string(),
                job.state.to_string(),
                job.duration_ms.map(format_duration).unwrap_or_else(|| "-".to_string()),
                job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                job.reason().unwrap_or_default(),
            ]
        })
        .collect();

    let header = ["JOB", "STATE", "DURATION", "EXIT", "REASON"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::from("\n");
    out.push_str(&format_row(&header.map(String::from), &widths));
    for (row, job) in rows.iter().zip(&report.jobs) {
        let line = format_row(row, &widths);
        let line = match job.state {
            JobState::Succeeded => style(line).green().to_string(),
            JobState::Failed => style(line).red().to_string(),
            _ => style(line).dim().to_string(),
        };
        out.push_str(&line);
    }

    let status = match report.status {
        RunStatus::Succeeded => style(report.status.to_string()).green().bold(),
        RunStatus::Failed => style(report.status.to_string()).red().bold(),
        RunStatus::Neutral => style(report.status.to_string()).yellow().bold(),
    };
    out.push_str(&format!(
        "\nRun {} {} in {}{}\n",
        report.run_id,
        status,
        format_duration(report.duration_ms),
        if report.cancelled { " (cancelled)" } else { "" }
    ));
    out
}

fn format_row(cells: &[String; 5], widths: &[usize; 5]) -> String {
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i + 1 == cells.len() {
            line.push_str(cell);
        } else {
            line.push_str(&format!("{:<width$}  ", cell, width = *width));
        }
    }
    line.trim_end().to_string() + "\n"
}

/// Print the deterministic execution order of a resolved DAG.
pub fn print_plan(dag: &PipelineDag) {
    print!("{}", render_plan(dag));
}

fn render_plan(dag: &PipelineDag) -> String {
    let mut out = format!("Pipeline {} ({} instances)\n", dag.pipeline(), dag.len());
    for (position, index) in dag.topological_order().into_iter().enumerate() {
        let node = dag.node(index);
        let needs: Vec<String> = dag
            .predecessors(index)
            .into_iter()
            .map(|p| dag.node(p).key.to_string())
            .collect();
        out.push_str(&format!("{:>3}. {}", position + 1, node.key));
        if !needs.is_empty() {
            out.push_str(&format!("  <- {}", needs.join(", ")));
        }
        out.push('\n');
    }
    for name in dag.filtered() {
        out.push_str(&format!("  -  {} (filtered by trigger)\n", name));
    }
    out
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::context::TriggerEvent;
    use conduit_core::pipeline::PipelineDefinition;
    use conduit_core::run::JobKey;
    use conduit_scheduler::DagBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(125_000), "2m5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_render_plan() {
        let definition = PipelineDefinition::from_yaml(
            r#"
name: demo
jobs:
  - name: build
    steps: [{ name: run, run: "true" }]
  - name: test
    needs: [build]
    matrix:
      dimensions:
        os: [ubuntu, macos]
    steps: [{ name: run, run: "true" }]
"#,
        )
        .unwrap();
        let dag = DagBuilder::new().build(&definition, &TriggerEvent::manual()).unwrap();

        assert_eq!(
            render_plan(&dag),
            "Pipeline demo (3 instances)\n  1. build\n  2. test (os=ubuntu)  <- build\n  3. test (os=macos)  <- build\n"
        );
    }

    #[test]
    fn test_progress_lines() {
        let started = RunEvent::JobStarted {
            job: JobKey::plain("build"),
        };
        assert!(progress_line(&started).unwrap().contains("build"));
        assert!(progress_line(&RunEvent::JobReady { job: JobKey::plain("build") }).is_none());
    }
}
