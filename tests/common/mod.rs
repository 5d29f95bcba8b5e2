#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aflow::{
    Connection, MemoryCatalog, PageRequest, RawPage, RawRecord, Transport, TransportError,
};
use serde_json::json;

/// What the next `send` does. Once the script runs out every send is served.
#[derive(Debug, Clone)]
pub enum Step {
    Serve,
    Fail(TransportError),
    /// Serve, but report a different total.
    ServeWithTotal(u64),
    /// Answer with exactly this page, whatever was asked.
    Page(RawPage),
}

/// Memory catalog that counts requests and open connections and can be
/// scripted to fail.
#[derive(Debug, Clone)]
pub struct Instrumented {
    catalog: MemoryCatalog,
    script: Arc<Mutex<VecDeque<Step>>>,
    pub sends: Arc<AtomicUsize>,
    pub open: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
}

impl Instrumented {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            catalog: MemoryCatalog::new(records),
            script: Arc::default(),
            sends: Arc::default(),
            open: Arc::default(),
            connects: Arc::default(),
        }
    }

    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct InstrumentedConnection {
    transport: Instrumented,
}

impl Transport for Instrumented {
    type Connection = InstrumentedConnection;

    fn connect(&self) -> Result<InstrumentedConnection, TransportError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(InstrumentedConnection {
            transport: self.clone(),
        })
    }
}

impl Connection for InstrumentedConnection {
    fn send(&mut self, request: &PageRequest<'_>) -> Result<RawPage, TransportError> {
        let t = &self.transport;
        t.sends.fetch_add(1, Ordering::SeqCst);
        let step = t.script.lock().unwrap().pop_front().unwrap_or(Step::Serve);
        match step {
            Step::Serve => t.catalog.page(request),
            Step::Fail(err) => Err(err),
            Step::ServeWithTotal(total) => {
                let mut page = t.catalog.page(request)?;
                page.total_matches = Some(total);
                Ok(page)
            }
            Step::Page(page) => Ok(page),
        }
    }
}

impl Drop for InstrumentedConnection {
    fn drop(&mut self) {
        self.transport.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn auid(i: usize) -> String {
    format!("aflow:{:016x}", i)
}

/// `n` entries in ascending `auid` order.
pub fn catalog(n: usize) -> Vec<RawRecord> {
    const SPECIES: [&str; 4] = ["Fe", "Ni", "Al", "O"];
    (0..n)
        .map(|i| {
            json!({
                "auid": auid(i),
                "compound": format!("{}{}", SPECIES[i % 4], i % 7 + 1),
                "density": 1.0 + (i % 10) as f64,
                "Egap": (i % 5) as f64 * 0.5,
                "species": [SPECIES[i % 4], SPECIES[(i + 1) % 4]],
                "is_metal": i % 5 == 0,
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect()
}

pub fn auids(records: &[aflow::Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.string("auid").unwrap().to_string())
        .collect()
}
