//! Interface de terminal do renderflow: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra de progresso da execução e `console` para
//! estilizar o plano, o relatório final e os checkpoints. O [`RunProgress`]
//! recebe os eventos do orquestrador via [`ProgressSink`].

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{ProgressSink, RunReport, RunStatus};
use crate::pool::Health;
use crate::queue::QueueManager;
use crate::state_machine::{Job, JobGraph, JobId, JobState};
use crate::store::{RunPhase, RunState};

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

    fn state(&self, state: JobState) -> &Style {
        match state {
            JobState::Completed => &self.green,
            JobState::Failed => &self.red,
            JobState::Pending => &self.dim,
            JobState::Assigned | JobState::Running => &self.yellow,
        }
    }
}

/// Barra de progresso de uma execução inteira.
///
/// Avança a cada job terminal; retentativas e falhas propagadas são
/// impressas acima da barra.
pub struct RunProgress {
    pb: ProgressBar,
    palette: Palette,
}

impl RunProgress {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        Self {
            pb,
            palette: Palette::new(),
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for RunProgress {
    fn run_started(&self, total: usize, already_completed: usize) {
        self.pb.set_length(total as u64);
        self.pb.set_position(already_completed as u64);
    }

    fn job_dispatched(&self, job: &JobId, instance: &str) {
        self.pb.set_message(format!("{job} → {instance}"));
    }

    fn job_retrying(&self, job: &Job, delay_ms: u64) {
        let reason = job
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        self.pb.println(format!(
            "  {} Retry {}/{} {}: {reason} (waiting {delay_ms}ms)",
            self.palette.yellow.apply_to("↻"),
            job.attempt_count,
            job.retry_config.max_retries,
            job.id,
        ));
    }

    fn job_finished(&self, job: &Job) {
        self.pb.inc(1);
        if job.state == JobState::Failed {
            let reason = job
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.pb
                .println(format!("  {} {} failed: {reason}", self.palette.red.apply_to("✗"), job.id));
        }
    }

    fn jobs_propagated(&self, failed: &JobId, dependents: &[JobId]) {
        self.pb.inc(dependents.len() as u64);
        self.pb.println(format!(
            "  {} {} dependent jobs of {failed} will not run",
            self.palette.red.apply_to("✗"),
            dependents.len()
        ));
    }

    fn run_finished(&self, _status: RunStatus) {
        self.pb.finish_and_clear();
    }
}

/// Imprime o plano sem executar nada (`--dry-run`).
pub fn print_plan(graph: &JobGraph) {
    let palette = Palette::new();
    println!("{}", palette.green.apply_to("─── Plan ───"));
    for stream in graph.streams() {
        let jobs: Vec<&Job> = graph.stream_jobs(stream).collect();
        println!("{} ({} jobs)", palette.yellow.apply_to(stream), jobs.len());
        for job in jobs {
            let deps = if job.depends_on.is_empty() {
                "-".to_string()
            } else {
                job.depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!(
                "  {:<28} units {:>6}..{:<6} after {}",
                job.id,
                job.start_unit,
                job.start_unit + job.unit_count,
                palette.dim.apply_to(deps)
            );
        }
    }
    let totals: Vec<String> = QueueManager::counts(graph)
        .into_iter()
        .map(|(category, counts)| format!("{} {category}", counts.pending))
        .collect();
    println!("{} jobs: {}", graph.len(), totals.join(", "));
}

/// Imprime o relatório final de uma execução.
pub fn print_report(report: &RunReport) {
    let palette = Palette::new();
    let (style, label) = match report.status {
        RunStatus::Completed => (&palette.green, "completed"),
        RunStatus::PartialFailure => (&palette.red, "partial failure"),
        RunStatus::FatalConfigError => (&palette.red, "fatal configuration error"),
        RunStatus::Cancelled => (&palette.yellow, "cancelled"),
    };

    println!();
    println!("{}", style.apply_to(format!("─── Run {} {label} ───", report.run_id)));
    if let Some(err) = &report.config_error {
        println!("  {} {err}", palette.red.apply_to("✗"));
    }
    if let Some(instance) = &report.degraded_to {
        println!("  {} degraded mode: uncovered categories ran on {instance}", palette.yellow.apply_to("!"));
    }
    println!(
        "  {} of {} jobs completed, {} dispatched this session",
        report.completed_jobs(),
        report.ledger.len(),
        report.dispatched
    );
    if !report.requeued_on_resume.is_empty() {
        println!("  {} interrupted jobs ran again", report.requeued_on_resume.len());
    }
    for failed in &report.failed {
        let reason = failed
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!("  {} {}: {reason}", palette.red.apply_to("✗"), failed.job_id);
    }
    for instance in report.instances.iter().filter(|i| i.health != Health::Healthy) {
        println!(
            "  {} instance {} ({}) {}",
            palette.yellow.apply_to("!"),
            instance.id,
            instance.address,
            instance.health
        );
    }
    for upload in &report.uploaded {
        println!("  {} {} → {}", palette.green.apply_to("↑"), upload.artifact, upload.location);
    }
    for failure in &report.upload_failures {
        println!(
            "  {} upload of {} failed: {}",
            palette.yellow.apply_to("!"),
            failure.artifact,
            failure.error
        );
    }
}

/// Imprime o estado salvo de uma execução (`status RUN_ID`).
pub fn print_checkpoint(state: &RunState) {
    let palette = Palette::new();
    let style = match state.status {
        RunPhase::Completed => &palette.green,
        RunPhase::PartialFailure | RunPhase::Aborted => &palette.red,
        RunPhase::Running | RunPhase::Cancelled => &palette.yellow,
    };
    println!(
        "{} {} (updated {})",
        state.run_id,
        style.apply_to(format!("{:?}", state.status).to_lowercase()),
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for job in &state.jobs {
        let mut line = format!(
            "  {:<28} {:<10} attempts {}",
            job.id,
            palette.state(job.state).apply_to(job.state),
            job.attempt_count
        );
        if let Some(err) = &job.last_error {
            line.push_str(&format!("  {err}"));
        }
        println!("{line}");
    }
    if !state.uploaded_streams.is_empty() {
        let streams: Vec<&str> = state.uploaded_streams.iter().map(String::as_str).collect();
        println!("  uploaded: {}", streams.join(", "));
    }
}

/// Lista as execuções com checkpoint (`status` sem argumento).
pub fn print_runs(states: &[RunState]) {
    let palette = Palette::new();
    if states.is_empty() {
        println!("{}", palette.dim.apply_to("no runs yet"));
        return;
    }
    for state in states {
        let done = state
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .count();
        println!(
            "{:<32} {:<16} {done}/{} jobs",
            state.run_id,
            format!("{:?}", state.status).to_lowercase(),
            state.jobs.len()
        );
    }
}
