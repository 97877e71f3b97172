//! Interface de terminal do groupmail: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra de progresso do envio e `console` para
//! estilização. O [`DispatchProgress`] acompanha o canal de status do
//! scheduler; as funções `print_*` formatam plano, status e relatório.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::AttemptOutcome;
use crate::pipeline::Prepared;
use crate::progress::ProgressSnapshot;
use crate::report::DispatchReport;
use crate::resolver::ResolutionOutcome;

/// Barra de progresso alimentada pelos snapshots publicados pelo scheduler.
pub struct DispatchProgress {
    // Barra do indicatif compartilhada com a task de atualização.
    pb: ProgressBar,
    // Task que escuta o canal de status.
    task: JoinHandle<()>,
}

impl DispatchProgress {
    /// Cria a barra e começa a ouvir `status`.
    pub fn start(mut status: watch::Receiver<ProgressSnapshot>) -> Self {
        let initial = status.borrow_and_update().clone();
        let pb = ProgressBar::new(initial.job_ids.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        update(&pb, &initial);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        let bar = pb.clone();
        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let snapshot = status.borrow_and_update().clone();
                update(&bar, &snapshot);
            }
        });

        Self { pb, task }
    }

    /// Interrompe a escuta e limpa a barra.
    pub fn finish(self) {
        self.task.abort();
        self.pb.finish_and_clear();
    }
}

// Posição = jobs concluídos; mensagem = estado e última tentativa.
fn update(pb: &ProgressBar, snapshot: &ProgressSnapshot) {
    pb.set_position(snapshot.next_index as u64);
    let last = snapshot
        .job_ids
        .get(snapshot.next_index)
        .and_then(|id| snapshot.latest_attempt(id))
        .map(|a| format!(" (retrying, attempt {}: {})", a.attempt, a.outcome))
        .unwrap_or_default();
    pb.set_message(format!("{}{last}", snapshot.state));
}

/// Imprime o plano: destinatário ou motivo de cada grupo.
pub fn print_plan(prepared: &Prepared) {
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    println!(
        "{}",
        Style::new().bold().apply_to(format!(
            "{} groups, {} jobs, {} skipped",
            prepared.groups.len(),
            prepared.plan.jobs.len(),
            prepared.plan.skipped.len()
        ))
    );

    for (group, resolution) in prepared.groups.iter().zip(&prepared.resolutions) {
        let rows = dim.apply_to(format!("{} rows", group.aggregates.row_count));
        match resolution {
            ResolutionOutcome::Resolved(email) => {
                // Um grupo resolvido ainda pode ter sido pulado (e-mail inválido, template).
                let skipped = prepared
                    .plan
                    .skipped
                    .iter()
                    .find(|s| s.group_key == group.key);
                match skipped {
                    Some(s) => println!(
                        "  {} {} {rows}: {}",
                        yellow.apply_to("○"),
                        group.key,
                        s.reason
                    ),
                    None => println!("  {} {} {rows} → {email}", green.apply_to("●"), group.key),
                }
            }
            ResolutionOutcome::Ambiguous(candidates) => {
                println!(
                    "  {} {} {rows}: conflicting recipients",
                    yellow.apply_to("○"),
                    group.key
                );
                for c in candidates {
                    println!("      {} ×{}", c.email, c.occurrences);
                }
            }
            ResolutionOutcome::Skipped(reason) => {
                println!("  {} {} {rows}: {reason}", yellow.apply_to("○"), group.key);
            }
        }
    }

    if !prepared.unkeyed.is_empty() {
        println!(
            "{}",
            yellow.apply_to(format!(
                "{} rows without a group key were not grouped",
                prepared.unkeyed.len()
            ))
        );
    }
}

/// Imprime o snapshot salvo.
pub fn print_status(snapshot: &ProgressSnapshot) {
    println!(
        "{} {}",
        Style::new().bold().apply_to("State:"),
        snapshot.state
    );
    println!(
        "  {}/{} jobs done, {} succeeded, {} remaining",
        snapshot.next_index,
        snapshot.job_ids.len(),
        snapshot.succeeded(),
        snapshot.remaining()
    );
    println!(
        "  {}",
        Style::new()
            .dim()
            .apply_to(format!("updated {}", snapshot.updated_at.to_rfc3339()))
    );
}

/// Imprime o relatório final do envio.
///
/// Sucessos em verde, falhas em vermelho, pendentes e pulados em amarelo.
pub fn print_report(report: &DispatchReport) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    println!();
    println!("{}", Style::new().bold().apply_to("─── Dispatch Report ───"));
    println!("  State: {}", report.state);
    println!(
        "  {} {}/{} delivered",
        green.apply_to("✓"),
        report.succeeded,
        report.total_jobs
    );

    for failure in &report.failed {
        let kind = if failure.permanent {
            "permanent"
        } else {
            "gave up"
        };
        println!(
            "  {} {} → {} ({kind} after {} attempts): {}",
            red.apply_to("✗"),
            failure.group_key,
            failure.recipient,
            failure.attempts,
            failure.reason
        );
    }

    if report.pending > 0 {
        println!("  {} {} jobs pending", yellow.apply_to("…"), report.pending);
    }
    for skipped in &report.skipped {
        println!(
            "  {} {} skipped: {}",
            yellow.apply_to("○"),
            skipped.group_key,
            skipped.reason
        );
    }
}

/// Imprime o resultado do envio de teste.
pub fn print_test_send(recipient: &str, outcome: &AttemptOutcome) {
    if outcome.is_success() {
        println!(
            "  {} Test message sent to {recipient}",
            Style::new().green().bold().apply_to("✓")
        );
    } else {
        println!(
            "  {} Test message to {recipient} failed: {outcome}",
            Style::new().red().bold().apply_to("✗")
        );
    }
}
