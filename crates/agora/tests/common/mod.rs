//! Shared fixtures: a fabric pre-loaded with probe behaviors, and a
//! process-global recording board the probes write to (objects migrate
//! between nodes, so probe output cannot live inside the objects).

use agora::{ActiveObject, ApplicationFault, CallContext, Fabric};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub fn test_fabric() -> Arc<Fabric> {
    let fabric = Fabric::new();
    fabric.behaviors().register_serde::<Counter>("counter");
    fabric.behaviors().register_serde::<Recorder>("recorder");
    fabric.behaviors().register_serde::<Faulty>("faulty");
    fabric.behaviors().register_serde::<Summer>("summer");
    fabric
}

fn fault(e: impl std::fmt::Display) -> ApplicationFault {
    ApplicationFault::new(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(args: &[u8]) -> Result<T, ApplicationFault> {
    serde_json::from_slice(args).map_err(fault)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ApplicationFault> {
    serde_json::to_vec(value).map_err(fault)
}

// Recording board, keyed by probe name. Probe names must be unique per
// test; tests share the process.
static RECORDINGS: OnceLock<Mutex<HashMap<String, Vec<String>>>> = OnceLock::new();

fn recordings() -> &'static Mutex<HashMap<String, Vec<String>>> {
    RECORDINGS.get_or_init(Default::default)
}

pub fn recorded(probe: &str) -> Vec<String> {
    recordings()
        .lock()
        .unwrap()
        .get(probe)
        .cloned()
        .unwrap_or_default()
}

fn record(probe: &str, entry: String) {
    recordings()
        .lock()
        .unwrap()
        .entry(probe.to_string())
        .or_default()
        .push(entry);
}

// Gates let a test hold a method call mid-execution. A gated method spins
// on its probe's flag, so tests using one need a multi-thread runtime.
static GATES: OnceLock<Mutex<HashMap<String, Arc<AtomicBool>>>> = OnceLock::new();

fn gate(probe: &str) -> Arc<AtomicBool> {
    GATES
        .get_or_init(Default::default)
        .lock()
        .unwrap()
        .entry(probe.to_string())
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

pub fn open_gate(probe: &str) {
    gate(probe).store(true, Ordering::SeqCst);
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Running total with snapshot-preserved state.
#[derive(Debug, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
}

impl ActiveObject for Counter {
    fn dispatch(
        &mut self,
        _ctx: &CallContext,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ApplicationFault> {
        match method {
            "add" => {
                self.value += decode::<i64>(args)?;
                encode(&self.value)
            }
            "get" => encode(&self.value),
            other => Err(fault(format!("counter has no method {other}"))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault> {
        encode(self)
    }
}

/// Writes every served value to the recording board, in service order.
/// `gated_record` additionally blocks mid-call until the probe's gate
/// opens, marking `begin:<value>` first so tests can see it start.
#[derive(Debug, Serialize, Deserialize)]
pub struct Recorder {
    pub probe: String,
}

impl ActiveObject for Recorder {
    fn dispatch(
        &mut self,
        _ctx: &CallContext,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ApplicationFault> {
        match method {
            "record" => {
                let value: String = decode(args)?;
                record(&self.probe, value);
                encode(&())
            }
            "slow_record" => {
                let value: String = decode(args)?;
                record(&self.probe, format!("enter:{value}"));
                std::thread::sleep(Duration::from_millis(3));
                record(&self.probe, format!("exit:{value}"));
                encode(&())
            }
            "gated_record" => {
                let value: String = decode(args)?;
                record(&self.probe, format!("begin:{value}"));
                let open = gate(&self.probe);
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                record(&self.probe, value);
                encode(&())
            }
            other => Err(fault(format!("recorder has no method {other}"))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault> {
        encode(self)
    }
}

/// Fails on demand, for fault-isolation tests.
#[derive(Debug, Serialize, Deserialize)]
pub struct Faulty {
    pub should_fail: bool,
}

impl ActiveObject for Faulty {
    fn dispatch(
        &mut self,
        _ctx: &CallContext,
        method: &str,
        _args: &[u8],
    ) -> Result<Vec<u8>, ApplicationFault> {
        match method {
            "poke" if self.should_fail => Err(ApplicationFault::new("poked a faulty object")),
            "poke" => encode(&"ok"),
            other => Err(fault(format!("faulty has no method {other}"))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault> {
        encode(self)
    }
}

/// Sums whatever it is given: a bare number, or an array of numbers (the
/// shape a round-robin chunk arrives in).
#[derive(Debug, Serialize, Deserialize)]
pub struct Summer;

impl ActiveObject for Summer {
    fn dispatch(
        &mut self,
        _ctx: &CallContext,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ApplicationFault> {
        match method {
            "sum" => {
                let input: Value = decode(args)?;
                let total = match &input {
                    Value::Number(n) => n.as_i64().ok_or_else(|| fault("not an integer"))?,
                    Value::Array(items) => items
                        .iter()
                        .map(|v| v.as_i64().ok_or_else(|| fault("not an integer")))
                        .sum::<Result<i64, _>>()?,
                    other => return Err(fault(format!("cannot sum {other}"))),
                };
                encode(&total)
            }
            other => Err(fault(format!("summer has no method {other}"))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault> {
        encode(&())
    }
}
