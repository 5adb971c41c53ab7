//! Choosing which listed operation a retry should resume.

use std::ops::ControlFlow;

use spanrpc_core::{Operation, Timestamp};

use crate::error::RpcError;
use crate::transport::OperationLister;

/// Running selection over listed candidates.
///
/// A candidate is eligible only if its start time is at or after the first
/// attempt's call time; among eligible candidates the latest start wins.
/// A candidate with no start time that is still running is taken as the
/// answer immediately, provided nothing has been selected yet, since
/// operations that just began may not report a start time.
///
/// Known limitation: that shortcut assumes the unstamped operation is ours.
/// When several unstamped operations for the same resource are running at
/// once, the first one listed is chosen, and it may belong to another
/// caller.
#[derive(Debug, Clone)]
pub struct MostRecentSelector {
    initial_call_time: Timestamp,
    best: Option<Operation>,
    best_start: Option<Timestamp>,
}

impl MostRecentSelector {
    #[must_use]
    pub fn new(initial_call_time: Timestamp) -> Self {
        Self {
            initial_call_time,
            best: None,
            best_start: None,
        }
    }

    /// Considers one candidate. `Break` means the scan can stop.
    pub fn offer(&mut self, operation: Operation, start_time: Option<Timestamp>) -> ControlFlow<()> {
        match start_time {
            Some(start) if start >= self.initial_call_time => {
                if self.best_start.map_or(true, |best| start > best) {
                    self.best_start = Some(start);
                    self.best = Some(operation);
                }
                ControlFlow::Continue(())
            }
            Some(_) => ControlFlow::Continue(()),
            None if self.best.is_none() && !operation.done => {
                self.best = Some(operation);
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        }
    }

    #[must_use]
    pub fn into_selected(self) -> Option<Operation> {
        self.best
    }
}

/// Scans every page from `lister` and returns the operation most likely
/// started by an earlier attempt of the same call.
///
/// # Errors
///
/// Propagates the first listing failure; a partially scanned selection is
/// discarded.
pub async fn most_recent_operation<L, F>(
    lister: &L,
    start_time: F,
    initial_call_time: Timestamp,
) -> Result<Option<Operation>, RpcError>
where
    L: OperationLister + ?Sized,
    F: Fn(&Operation) -> Option<Timestamp>,
{
    let mut selector = MostRecentSelector::new(initial_call_time);
    let mut page_token: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let page = lister.list_operations(page_token.as_deref()).await?;
        pages += 1;
        for operation in page.operations {
            let started = start_time(&operation);
            if selector.offer(operation, started).is_break() {
                return Ok(selector.into_selected());
            }
        }
        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    tracing::trace!(pages, "operation scan exhausted all pages");
    Ok(selector.into_selected())
}
