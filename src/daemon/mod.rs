pub mod notifier;
pub mod schedule;

use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::token_manager::TokenManager;
use crate::daemon::notifier::Notifier;
use crate::domain::problem::ProblemRecord;
use crate::error::Result;
use crate::mail::extract::extract;
use crate::mail::imap_client::Mailbox;
use crate::store::cache::ProblemCache;

/// Everything needed to scan one mail account.
pub struct AccountPipeline {
    pub name: String,
    pub email: String,
    pub tokens: TokenManager,
    pub mailbox: Arc<dyn Mailbox>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub fetched: usize,
    pub skipped: usize,
    pub cached: usize,
    pub new_problems: Vec<ProblemRecord>,
}

/// One scan of one account: authorize, query, extract, upsert. Blocking.
pub fn scan_account(account: &AccountPipeline, cache: &ProblemCache) -> Result<ScanReport> {
    let cred = account.tokens.credential(false)?;
    let emails = account.mailbox.scan(&account.email, &cred.access_token)?;

    let mut report = ScanReport {
        fetched: emails.len(),
        ..Default::default()
    };
    for email in &emails {
        let Some(record) = extract(email) else {
            report.skipped += 1;
            continue;
        };
        report.cached += 1;
        if cache.upsert(record.clone()) {
            report.new_problems.push(record);
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanReason {
    Startup,
    Scheduled,
    Manual,
}

/// Queues scans on every account worker.
#[derive(Clone)]
pub struct ScanTrigger {
    senders: Vec<mpsc::UnboundedSender<ScanReason>>,
}

impl ScanTrigger {
    pub fn fire(&self, reason: ScanReason) {
        for tx in &self.senders {
            if tx.send(reason).is_err() {
                warn!("scan worker is gone; {reason:?} scan not queued");
            }
        }
    }
}

/// Start one worker task per account. Must be called inside a tokio runtime.
pub fn spawn_workers(
    accounts: Vec<AccountPipeline>,
    cache: Arc<ProblemCache>,
    notifier: Option<Notifier>,
) -> ScanTrigger {
    let senders = accounts
        .into_iter()
        .map(|account| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(account_worker(
                Arc::new(account),
                Arc::clone(&cache),
                rx,
                notifier.clone(),
            ));
            tx
        })
        .collect();
    ScanTrigger { senders }
}

async fn account_worker(
    account: Arc<AccountPipeline>,
    cache: Arc<ProblemCache>,
    mut rx: mpsc::UnboundedReceiver<ScanReason>,
    notifier: Option<Notifier>,
) {
    // nothing is announced until this account has completed one scan
    let mut primed = false;

    while let Some(mut reason) = rx.recv().await {
        // requests queued while the previous scan ran collapse into one
        while let Ok(next) = rx.try_recv() {
            reason = next;
        }
        info!("[{}] {reason:?} scan started", account.name);

        let (acc, c) = (Arc::clone(&account), Arc::clone(&cache));
        match tokio::task::spawn_blocking(move || scan_account(&acc, &c)).await {
            Ok(Ok(report)) => {
                info!(
                    "[{}] scan done: {} fetched, {} cached, {} skipped, {} new",
                    account.name,
                    report.fetched,
                    report.cached,
                    report.skipped,
                    report.new_problems.len()
                );
                if primed && let Some(n) = &notifier {
                    for record in report.new_problems {
                        n.notify_problem(record);
                    }
                }
                primed = true;
            }
            Ok(Err(e)) => error!("[{}] scan skipped: {e}", account.name),
            Err(e) => error!("[{}] scan task panicked: {e}", account.name),
        }
    }
}
