//! Single-instance guard and the long-running ingest loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::fetch::BarFetcher;
use crate::hours::TradingHoursGate;
use crate::limiter::RateLimiter;
use crate::scheduler::IntervalScheduler;

/// Filesystem-based single-instance guard: a PID file created atomically,
/// with liveness of a pre-existing holder verified by OS probe. Stale files
/// are reclaimed; a live holder fails the startup.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owned: bool,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir: {}", parent.display()))?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let pid = std::process::id();
                    file.write_all(pid.to_string().as_bytes())
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    file.sync_all()?;
                    info!(pid, path = %path.display(), "Acquired run lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        owned: true,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid != std::process::id() && process_alive(pid) => {
                            bail!("another instance is running (pid {pid}, lock {})", path.display());
                        }
                        _ => {
                            warn!(path = %path.display(), "Reclaiming stale PID file");
                            let _ = std::fs::remove_file(path);
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", path.display()));
                }
            }
        }
        bail!("could not acquire run lock at {}", path.display())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Cancel the token on SIGINT or SIGTERM.
pub fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => {},
                _ = int.recv() => {},
            }
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }
    Ok(())
}

/// How often the daemon refreshes the symbol list and revisits not-founds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceCadence {
    Never,
    Daily,
    Weekly,
    Monthly,
}

impl MaintenanceCadence {
    pub fn due(self, last: Option<NaiveDate>, today: NaiveDate) -> bool {
        let min_days = match self {
            MaintenanceCadence::Never => return false,
            MaintenanceCadence::Daily => 1,
            MaintenanceCadence::Weekly => 7,
            MaintenanceCadence::Monthly => 30,
        };
        match last {
            None => true,
            Some(d) => (today - d).num_days() >= min_days,
        }
    }
}

impl FromStr for MaintenanceCadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

pub struct DaemonLoop {
    scheduler: IntervalScheduler,
    fetcher: Arc<dyn BarFetcher>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    gate: Option<TradingHoursGate>,
    cycle: Duration,
    maintenance: MaintenanceCadence,
    symbols_file: Option<PathBuf>,
    last_maintenance: Option<NaiveDate>,
}

impl DaemonLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: IntervalScheduler,
        fetcher: Arc<dyn BarFetcher>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        gate: Option<TradingHoursGate>,
        cycle: Duration,
        maintenance: MaintenanceCadence,
        symbols_file: Option<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            fetcher,
            limiter,
            clock,
            cancel,
            gate,
            cycle,
            maintenance,
            symbols_file,
            last_maintenance: None,
        }
    }

    /// Cycle until cancelled: gate on trading hours, run maintenance at its
    /// cadence, sweep, sleep. On cancellation the current symbol finishes,
    /// the registry is persisted and the loop exits cleanly.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(gate) = &self.gate {
                let now = self.clock.now_utc();
                if !gate.is_active(now) {
                    let boundary = gate.next_active_boundary(now);
                    let wait = (boundary - now)
                        .to_std()
                        .unwrap_or(Duration::from_secs(60));
                    info!(%boundary, "Outside trading hours, sleeping until next open");
                    if sleep_cancellable(&self.cancel, wait).await {
                        break;
                    }
                    continue;
                }
            }

            self.maybe_run_maintenance().await?;
            if self.cancel.is_cancelled() {
                break;
            }

            self.scheduler.run(None, None).await?;

            if sleep_cancellable(&self.cancel, self.cycle).await {
                break;
            }
        }

        // The sweep saves on its own path; this covers a cancellation that
        // landed before any sweep ran.
        self.scheduler.registry().save()?;
        info!("Daemon loop exited cleanly");
        Ok(())
    }

    async fn maybe_run_maintenance(&mut self) -> Result<()> {
        let today = self.clock.today();
        if !self.maintenance.due(self.last_maintenance, today) {
            return Ok(());
        }
        info!("Running ticker maintenance");
        let registry = self.scheduler.registry_mut();
        registry.reload()?;
        if let Some(path) = &self.symbols_file {
            let symbols = read_symbols_file(path)?;
            registry.refresh_current_list(&symbols);
        }
        registry.reparse_not_founds();
        registry
            .confirm_not_founds(self.fetcher.as_ref(), self.limiter.as_ref())
            .await?;
        registry.save()?;
        self.last_maintenance = Some(today);
        Ok(())
    }
}

/// Sleep in ≤60 s slices so cancellation is observed promptly. Returns true
/// when the sleep ended because of cancellation.
pub async fn sleep_cancellable(cancel: &CancellationToken, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        let chunk = remaining.min(Duration::from_secs(60));
        tokio::select! {
            () = cancel.cancelled() => return true,
            () = tokio::time::sleep(chunk) => {}
        }
        remaining -= chunk;
    }
    cancel.is_cancelled()
}

/// One symbol per line; blank lines and `#` comments ignored.
pub fn read_symbols_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read symbols file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_uppercase)
        .collect())
}
