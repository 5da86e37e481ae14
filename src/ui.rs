//! Interface de terminal do postqueue: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner enquanto um tick ou uma publicação roda e
//! `console` para os resumos coloridos. Resultados estruturados saem em JSON
//! no stdout.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::graph::Profile;
use crate::queue::{EnqueueOutcome, Job, JobStatistics, JobStatus};
use crate::scheduler::{TickOutcome, TickReport};

/// Spinner exibido durante uma operação demorada.
pub struct Progress {
    pb: ProgressBar,
}

impl Progress {
    /// Inicia o spinner com a mensagem dada.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Remove o spinner da tela.
    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

/// Estilos usados nos resumos.
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn for_status(&self, status: JobStatus) -> &Style {
        match status {
            JobStatus::Done => &self.green,
            JobStatus::Failed => &self.red,
            JobStatus::Publishing => &self.yellow,
            JobStatus::Queued => &self.dim,
        }
    }
}

/// Imprime qualquer resultado serializável como JSON formatado.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_enqueue(outcome: &EnqueueOutcome) -> Result<(), serde_json::Error> {
    let palette = Palette::new();
    if outcome.queued {
        eprintln!("  {} Job queued", palette.green.apply_to("✓"));
    } else {
        eprintln!("  {} Already scheduled, nothing queued", palette.yellow.apply_to("="));
    }
    print_json(outcome)
}

/// Resumo de um tick: verde para publicados, vermelho para falhas.
pub fn print_tick(outcome: &TickOutcome) -> Result<(), serde_json::Error> {
    let palette = Palette::new();
    match outcome {
        TickOutcome::Busy => {
            eprintln!("  {} A run is already active", palette.yellow.apply_to("⏳"));
        }
        TickOutcome::Completed(report) => print_report(&palette, report),
    }
    print_json(outcome)
}

fn print_report(palette: &Palette, report: &TickReport) {
    if report.processed == 0 && report.reclaimed == 0 {
        eprintln!("  {} No due jobs", palette.dim.apply_to("·"));
        return;
    }
    eprintln!(
        "  {} {} published",
        palette.green.apply_to("✓"),
        report.published
    );
    if report.failed > 0 {
        eprintln!("  {} {} requeued", palette.yellow.apply_to("↻"), report.failed);
    }
    if report.dead_lettered > 0 {
        eprintln!(
            "  {} {} failed for good",
            palette.red.apply_to("✗"),
            report.dead_lettered
        );
    }
    if report.reclaimed > 0 {
        eprintln!(
            "  {} {} stale leases reclaimed",
            palette.yellow.apply_to("↺"),
            report.reclaimed
        );
    }
    if report.superseded > 0 {
        eprintln!(
            "  {} {} lost to another claimer",
            palette.dim.apply_to("·"),
            report.superseded
        );
    }
}

/// Tabela de contagens por status seguida dos jobs listados.
pub fn print_status(stats: &JobStatistics, jobs: &[Job]) {
    let palette = Palette::new();
    println!(
        "{} queued  {} publishing  {} done  {} failed  ({} total)",
        palette.dim.apply_to(stats.queued),
        palette.yellow.apply_to(stats.publishing),
        palette.green.apply_to(stats.done),
        palette.red.apply_to(stats.failed),
        stats.total()
    );
    if jobs.is_empty() {
        return;
    }
    println!();
    for job in jobs {
        let style = palette.for_status(job.status);
        println!(
            "{} {}  {}  attempts={}  {}",
            style.apply_to(format!("{:<10}", job.status.as_str())),
            &job.key[..12.min(job.key.len())],
            job.publish_at.to_rfc3339(),
            job.attempts,
            job.artifact_ref
        );
        if let Some(error) = &job.last_error {
            println!("           {}", palette.red.apply_to(error));
        }
    }
}

pub fn print_published(published_id: &str) {
    let palette = Palette::new();
    println!("  {} Published media {published_id}", palette.green.apply_to("✓"));
}

pub fn print_failure(message: &str) {
    let palette = Palette::new();
    eprintln!("  {} {message}", palette.red.apply_to("✗"));
}

pub fn print_profile(profile: &Profile) -> Result<(), serde_json::Error> {
    let palette = Palette::new();
    eprintln!(
        "  {} Connected as {}",
        palette.green.apply_to("✓"),
        profile.username.as_deref().unwrap_or(&profile.id)
    );
    print_json(profile)
}
