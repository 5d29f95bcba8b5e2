use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::compiler::{CompiledRequest, Direction, QueryRequest, compile, compile_raw};
use crate::config::{ClientConfig, load_config};
use crate::entry;
use crate::error::Result;
use crate::executor::{CancelToken, ExecutionStats, Pages, RetryPolicy, execute};
use crate::filter::FilterNode;
use crate::http::HttpTransport;
use crate::materialize::{Record, materialize};
use crate::registry::PropertyDescriptor;
use crate::transport::Transport;

/// Entry point for queries against AFLUX or any other [`Transport`].
#[derive(Debug, Clone)]
pub struct Client<T = HttpTransport> {
    transport: T,
    page_size: usize,
    retry: RetryPolicy,
}

impl Client<HttpTransport> {
    /// Creates a client using environment variables and/or `.aflowrc`.
    ///
    /// This is equivalent to `Client::new(None, None)`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `url`/`verify` arguments
    /// - environment variables `AFLOW_URL`, `AFLOW_PAGE_SIZE`, `AFLOW_MAX_RETRIES`, `AFLOW_TIMEOUT`
    /// - config file from `AFLOW_RC` or `.aflowrc`
    pub fn new(url: Option<String>, verify: Option<bool>) -> anyhow::Result<Self> {
        Self::from_config(load_config(url, verify)?)
    }

    pub fn from_config(cfg: ClientConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(cfg.url, cfg.timeout, cfg.verify)?;
        Ok(Self {
            transport,
            page_size: cfg.page_size,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                ..RetryPolicy::default()
            },
        })
    }

    /// Per-request timeout. Rebuilds the HTTP client.
    pub fn with_timeout(mut self, timeout: Duration) -> anyhow::Result<Self> {
        self.transport = HttpTransport::new(
            self.transport.url().to_string(),
            timeout,
            self.transport.verifies_tls(),
        )?;
        Ok(self)
    }

    /// AFLUX help text, general or for one keyword.
    pub fn help(&self, keyword: Option<&str>) -> anyhow::Result<String> {
        entry::help(&self.transport, keyword)
    }

    /// Relaxed structure of an entry in POSCAR layout. Needs `aurl`.
    pub fn structure(&self, record: &Record) -> anyhow::Result<String> {
        entry::structure(&self.transport, record)
    }

    /// Writes the relaxed structure of an entry to `target`.
    pub fn download_structure(&self, record: &Record, target: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let poscar = self.structure(record)?;
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
        }
        std::fs::write(target, poscar)
            .with_context(|| format!("failed to write {}", target.display()))
    }

    /// A file-backed property of an entry, split into its `;` parts.
    pub fn entry_property(&self, record: &Record, name: &str) -> anyhow::Result<Vec<String>> {
        entry::entry_property(&self.transport, record, name)
    }
}

impl<T: Transport + Clone> Client<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            page_size: crate::compiler::DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Starts a query. Nothing is sent until the returned records are pulled.
    pub fn query(&self) -> Query<'_, T> {
        Query {
            client: self,
            request: QueryRequest::new().page_size(self.page_size),
            cancel: CancelToken::new(),
        }
    }

    /// Compiles and starts a prepared request.
    pub fn run(&self, request: &QueryRequest) -> Result<Records<T>> {
        self.run_with(request, CancelToken::new())
    }

    /// Runs a hand-written AFLUX matchbook, e.g.
    /// `species(Fe:Ni),ael_bulk_modulus_vrh(100*)`.
    ///
    /// The matchbook is checked against the AFLUX keyword list before
    /// anything is sent. Paging and ordering directives are added here.
    /// Fields are named by their AFLUX keyword; keywords outside the typed
    /// registry come back as inferred values.
    pub fn query_raw(&self, matchbook: &str) -> Result<Records<T>> {
        self.query_raw_with(matchbook, CancelToken::new())
    }

    pub fn query_raw_with(&self, matchbook: &str, cancel: CancelToken) -> Result<Records<T>> {
        Ok(self.start(compile_raw(matchbook, self.page_size)?, cancel))
    }

    fn run_with(&self, request: &QueryRequest, cancel: CancelToken) -> Result<Records<T>> {
        Ok(self.start(compile(request)?, cancel))
    }

    fn start(&self, compiled: CompiledRequest, cancel: CancelToken) -> Records<T> {
        tracing::debug!(matchbook = compiled.matchbook(), raw = compiled.is_raw(), "query compiled");
        let compiled = Arc::new(compiled);
        let select = Arc::clone(compiled.selected());
        Records {
            pages: execute(self.transport.clone(), compiled, self.retry, cancel),
            select,
        }
    }
}

/// Builder for one query. Property names are checked as they are given.
#[derive(Debug)]
pub struct Query<'a, T> {
    client: &'a Client<T>,
    request: QueryRequest,
    cancel: CancelToken,
}

impl<'a, T: Transport + Clone> Query<'a, T> {
    pub fn filter(mut self, filter: FilterNode) -> Self {
        self.request = self.request.filter(filter);
        self
    }

    pub fn select<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.request = self.request.select(names)?;
        Ok(self)
    }

    pub fn order_by(mut self, name: &str, direction: Direction) -> Result<Self> {
        self.request = self.request.order_by(name, direction)?;
        Ok(self)
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.request = self.request.page_size(page_size);
        self
    }

    /// Uses an existing token, so the query can be cancelled from elsewhere.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Compiles the query and returns its lazy record stream.
    pub fn fetch(self) -> Result<Records<T>> {
        self.client.run_with(&self.request, self.cancel)
    }
}

/// Lazy stream of typed records.
///
/// Yields `Err` once if a page cannot be fetched and then ends; records
/// already yielded stay valid. An exhausted stream, a failed one and a
/// cancelled one are told apart by the `Err` item and [`Records::is_cancelled`].
pub struct Records<T: Transport> {
    pages: Pages<T>,
    select: Arc<[&'static PropertyDescriptor]>,
}

impl<T: Transport> Records<T> {
    pub fn compiled(&self) -> &CompiledRequest {
        self.pages.compiled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.pages.cancel_token().clone()
    }

    /// Stops the query: no further page is requested and the connection is
    /// released immediately.
    pub fn cancel(&mut self) {
        self.pages.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.pages.is_cancelled()
    }

    pub fn stats(&self) -> ExecutionStats {
        self.pages.stats()
    }

    pub fn total_matches(&self) -> Option<u64> {
        self.pages.total_matches()
    }

    pub fn is_connected(&self) -> bool {
        self.pages.is_connected()
    }
}

impl<T: Transport> Iterator for Records<T> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pages
            .next()
            .map(|raw| raw.map(|raw| materialize(&raw, &self.select)))
    }
}
