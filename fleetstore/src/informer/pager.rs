use std::sync::Arc;

use kube::core::DynamicObject;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, FleetResult};
use crate::fleet_error;
use crate::informer::lister_watcher::{ListParams, ListerWatcher, ObjectList};

/// Page size requested when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: i64 = 500;

/// Iterates a paginated list API and aggregates the pages into one response.
///
/// A `page_size` of zero or less disables chunking: the request is sent once, as is.
/// With [`ListPager::list_with_sink`] items are delivered through the channel as each
/// page arrives and the aggregated response carries only the list metadata.
#[derive(Debug)]
pub struct ListPager<L> {
    lister: Arc<L>,
    pub page_size: i64,
    /// Whether an expired continuation may be recovered by one unpaginated pass.
    pub full_list_if_expired: bool,
}

impl<L: ListerWatcher> ListPager<L> {
    pub fn new(lister: Arc<L>) -> Self {
        Self {
            lister,
            page_size: DEFAULT_PAGE_SIZE,
            full_list_if_expired: true,
        }
    }

    /// Fetches all pages and returns the aggregated list plus whether more than one
    /// page was involved.
    pub async fn list(&self, params: ListParams) -> FleetResult<(ObjectList, bool)> {
        self.list_inner(params, None).await
    }

    /// Like [`ListPager::list`], but streams items into `sink` as pages arrive. The
    /// returned list carries the metadata of the first page and no items.
    ///
    /// Expired continuations are not recovered in this mode: items already handed to
    /// the caller cannot be taken back, so the error is surfaced instead.
    pub async fn list_with_sink(
        &self,
        params: ListParams,
        sink: mpsc::Sender<DynamicObject>,
    ) -> FleetResult<(ObjectList, bool)> {
        self.list_inner(params, Some(sink)).await
    }

    async fn list_inner(
        &self,
        params: ListParams,
        sink: Option<mpsc::Sender<DynamicObject>>,
    ) -> FleetResult<(ObjectList, bool)> {
        let mut options = params;
        if self.page_size > 0 {
            options.limit = self.page_size;
        }

        let mut paginated_result = false;
        let mut aggregate: Option<ObjectList> = None;

        loop {
            let page = match self.lister.list(options.clone()).await {
                Ok(page) => page,
                Err(err) => {
                    let continuing = options.continue_token.is_some();
                    let expired = err.is_expired() || err.is_too_large_resource_version();
                    if !expired || !continuing || !self.full_list_if_expired {
                        return Err(err);
                    }
                    if sink.is_some() {
                        return Err(err);
                    }

                    // The continuation window closed under us. Pages seen so far are
                    // dropped and the whole range is refetched in one best-effort
                    // request with no snapshot pinned.
                    options.limit = 0;
                    options.continue_token = None;
                    options.resource_version = String::new();
                    let list = self.lister.list(options).await?;
                    return Ok((list, false));
                }
            };

            let mut page = page;
            let continue_token = page.continue_token.take();
            let mut items = std::mem::take(&mut page.items);

            // List metadata comes from the first page.
            let list = aggregate.get_or_insert(page);
            match &sink {
                Some(sink) => {
                    for item in items {
                        if sink.send(item).await.is_err() {
                            return Err(fleet_error!(
                                ErrorKind::InternalError,
                                "list sink closed before all pages were delivered"
                            ));
                        }
                    }
                }
                None => list.items.append(&mut items),
            }

            let Some(token) = continue_token else { break };
            paginated_result = true;
            options.continue_token = Some(token);
        }

        Ok((aggregate.unwrap_or_default(), paginated_result))
    }
}
