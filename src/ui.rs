//! Interface de terminal do convoy: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra de progresso e `console` para estilização.
//! O [`RunProgress`] consome o fluxo de [`RunEvent`] de uma execução e o
//! reflete no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::events::RunEvent;
use crate::scheduler::{HaltReason, RunSummary};
use crate::state_machine::TaskOutcome;

/// Indicador visual de progresso de uma execução.
///
/// A barra avança a cada sucesso; falhas (vermelho), tarefas puladas
/// (amarelo) e ajustes de concorrência são impressos acima dela.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    /// Cria a barra com o alvo de sucessos da execução.
    pub fn start(target: u32) -> Self {
        let pb = ProgressBar::new(u64::from(target));
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.green/white}] {pos}/{len} sucessos {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Aplica um evento à barra.
    pub fn handle(&self, event: &RunEvent) {
        match event {
            RunEvent::BatchStarted { batch, size, .. } => {
                self.pb.set_message(format!("(lote {batch}, {size} tarefas)"));
            }
            RunEvent::TaskSettled(record) => match &record.outcome {
                TaskOutcome::Failed(reason) => self.pb.println(format!(
                    "  {} tarefa {}: {reason}",
                    self.red.apply_to("✗"),
                    record.task
                )),
                TaskOutcome::Skipped => self.pb.println(format!(
                    "  {} tarefa {} pulada",
                    self.yellow.apply_to("»"),
                    record.task
                )),
                TaskOutcome::Succeeded | TaskOutcome::Pending => {}
            },
            RunEvent::Progress(progress) => {
                self.pb.set_position(u64::from(progress.successful));
            }
            RunEvent::ConcurrencyAdjusted(change) => self.pb.println(format!(
                "  {} concorrência {} → {} (taxa {:.0}%)",
                self.yellow.apply_to("↻"),
                change.from,
                change.to,
                change.rate * 100.0
            )),
            RunEvent::Finished(_) => self.pb.finish_and_clear(),
        }
    }

    /// Consome eventos em segundo plano até o fim da execução.
    pub fn follow(self, mut events: broadcast::Receiver<RunEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let finished = matches!(event, RunEvent::Finished(_));
                        self.handle(&event);
                        if finished {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress display lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            self.pb.finish_and_clear();
        })
    }
}

/// Imprime o resumo final da execução.
pub fn print_summary(summary: &RunSummary) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();

    let headline = if summary.actual_successful >= summary.target_successful {
        green.apply_to(format!(
            "✓ {}/{} sucessos",
            summary.actual_successful, summary.target_successful
        ))
    } else {
        red.apply_to(format!(
            "✗ {}/{} sucessos",
            summary.actual_successful, summary.target_successful
        ))
    };
    let halt = match summary.halt_reason {
        HaltReason::TargetReached => "alvo atingido",
        HaltReason::AttemptCeiling => "limite de tentativas",
        HaltReason::Cancelled => "cancelada",
    };

    println!();
    println!("  {headline} ({halt})");
    println!(
        "  {}",
        dim.apply_to(format!(
            "{} tentativas, {} falhas, {} puladas, {} lotes",
            summary.total_attempts, summary.failed, summary.skipped, summary.batches
        ))
    );
    for change in &summary.concurrency_history {
        println!(
            "  {}",
            dim.apply_to(format!(
                "lote {}: concorrência {} → {}",
                change.batch, change.from, change.to
            ))
        );
    }
}
