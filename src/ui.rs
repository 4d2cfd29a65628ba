//! Interface de terminal do cutflow: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner do ciclo único e `console` para colorir
//! resumos, a tabela de jobs e o quadro de saúde das máquinas.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::health::HealthSignal;
use crate::orchestrator::{CycleSummary, StageOutcome, WatchRoot};
use crate::state_machine::{Advance, Job, JobStatus};

/// Spinner exibido enquanto um ciclo `once` está rodando.
pub struct CycleProgress {
    pb: ProgressBar,
}

impl CycleProgress {
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

fn status_style(status: JobStatus) -> Style {
    if status.is_terminal() {
        return Style::new().green().bold();
    }
    match status {
        JobStatus::Forwarded => Style::new().green(),
        JobStatus::CncFinish => Style::new().cyan(),
        JobStatus::Pending => Style::new().dim(),
        _ => Style::new().yellow(),
    }
}

/// Imprime uma linha por raiz com os contadores do ciclo.
pub fn print_cycle_summary(results: &[(WatchRoot, CycleSummary)]) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();

    let mut total = CycleSummary::default();
    for (root, s) in results {
        total.merge(s);
        let mark = if s.failed > 0 {
            red.apply_to("✗")
        } else {
            green.apply_to("✓")
        };
        println!(
            "  {mark} {root}: {} processed, {} advanced, {} waiting{}",
            s.processed,
            s.advanced,
            s.not_ready,
            if s.failed > 0 {
                format!(", {} failed", s.failed)
            } else {
                String::new()
            }
        );
        if s.handoffs_started > 0 {
            println!("    {}", dim.apply_to("handoff started"));
        }
    }
    println!(
        "{}",
        dim.apply_to(format!(
            "  {} roots, {} files seen, {} transitions",
            results.len(),
            total.seen,
            total.advanced
        ))
    );
}

/// Tabela de jobs ordenada por chave.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("  {}", Style::new().dim().apply_to("no jobs"));
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "  {:<32} {:<13} {:>7} {:<12} {:>5}",
            "JOB", "STATUS", "MACHINE", "PALLET", "PARTS"
        ))
    );
    for job in jobs {
        let machine = job.machine_id.map(|m| m.to_string()).unwrap_or_else(|| "-".into());
        let parts = job.part_count.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  {:<32} {} {:>7} {:<12} {:>5}",
            job.key,
            status_style(job.status).apply_to(format!("{:<13}", job.status)),
            machine,
            job.pallet.as_deref().unwrap_or("-"),
            parts
        );
    }
}

/// Quadro de saúde das máquinas; nada é impresso quando está vazio.
pub fn print_health(signals: &[HealthSignal]) {
    if signals.is_empty() {
        return;
    }
    let yellow = Style::new().yellow().bold();
    println!();
    println!("{}", yellow.apply_to("─── Machine Health ───"));
    for s in signals {
        let machine = s.machine_id.map(|m| format!("M{m}")).unwrap_or_else(|| "-".into());
        println!(
            "  {} {machine} {} (x{}): {}",
            yellow.apply_to("!"),
            s.kind,
            s.count,
            s.detail
        );
    }
}

pub fn print_stage(key: &str, outcome: &StageOutcome) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let report = &outcome.report;
    println!(
        "  {} copied, {} skipped, {} failed{}",
        report.copied.len(),
        report.skipped.len(),
        report.failed.len(),
        if report.generated.is_some() {
            ", parts list generated"
        } else {
            ""
        }
    );
    if !report.is_clean() {
        println!("  {}", red.apply_to("some files could not be staged:"));
    }
    for (path, error) in &report.failed {
        println!("  {} {}: {error}", red.apply_to("✗"), path.display());
    }
    match &outcome.advance {
        Some(Advance::Advanced(job)) => {
            println!("  {} {key} is now {}", green.apply_to("✓"), job.status);
        }
        Some(Advance::AlreadyAdvanced(status)) => {
            println!("  {key} already {status}");
        }
        Some(Advance::Rejected(e)) => println!("  {} {key}: {e}", red.apply_to("✗")),
        Some(Advance::UnknownJob) => println!("  {} {key}: unknown job", red.apply_to("✗")),
        None => println!("  {} {key}: primary program was not staged", red.apply_to("✗")),
    }
}
