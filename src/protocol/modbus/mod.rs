//! Modbus client: polls configured register blocks over TCP (MBAP) or
//! RTU framing spoken to a TCP serial-device server.
//!
//! Poll failures never kill the loop — exceptions and timeouts become
//! quality-flagged records; only transport errors return to the
//! supervisor for reconnection.

pub mod codec;

use super::{wait_for_stop, Ingress, ProtocolClient, TestReport};
use crate::config::{ModbusSourceOptions, RegisterBlock};
use crate::error::ProtocolError;
use crate::record::{CanonicalRecord, ProtocolKind, Quality, Value};
use crate::time::unix_micros_now;
use async_trait::async_trait;
use codec::{
    decode_mbap_header, decode_pdu, decode_response_rtu, encode_request_rtu, encode_request_tcp,
    Decoded, ReadRequest, Response, MBAP_HEADER_LEN,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const DEFAULT_PORT: u16 = 502;

/// Which framing the wire uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Tcp,
    Rtu,
}

/// Why one block poll produced no values.
enum PollFailure {
    Exception(u8),
    Timeout,
    Transport(String),
}

pub struct ModbusClient {
    source_name: String,
    endpoint: String,
    opts: ModbusSourceOptions,
    framing: Framing,
    addr: String,
    stream: Option<TcpStream>,
    transaction_id: u16,
    polls_completed: u64,
}

impl ModbusClient {
    pub fn new(source_name: String, endpoint: String, opts: ModbusSourceOptions) -> Self {
        let (framing, addr) = parse_endpoint(&endpoint);
        Self {
            source_name,
            endpoint,
            opts,
            framing,
            addr,
            stream: None,
            transaction_id: 0,
            polls_completed: 0,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.opts.timeout_ms.max(1))
    }

    async fn transact(&mut self, req: &ReadRequest) -> Result<Response, PollFailure> {
        let deadline = self.timeout();
        let framing = self.framing;
        let io = async {
            match framing {
                Framing::Tcp => self.transact_tcp(req).await,
                Framing::Rtu => self.transact_rtu(req).await,
            }
        };
        match tokio::time::timeout(deadline, io).await {
            Ok(result) => result,
            Err(_) => Err(PollFailure::Timeout),
        }
    }

    async fn transact_tcp(&mut self, req: &ReadRequest) -> Result<Response, PollFailure> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        let frame = encode_request_tcp(tid, req);
        stream.write_all(&frame).await.map_err(io_failure)?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(io_failure)?;
        let (resp_tid, unit, pdu_len) =
            decode_mbap_header(&header).map_err(|e| PollFailure::Transport(e.to_string()))?;
        if resp_tid != tid {
            return Err(PollFailure::Transport(format!(
                "transaction id mismatch: sent {tid}, got {resp_tid}"
            )));
        }
        if unit != req.unit_id {
            return Err(PollFailure::Transport(format!(
                "unit mismatch: expected {}, got {unit}",
                req.unit_id
            )));
        }

        let mut pdu = vec![0u8; pdu_len];
        stream.read_exact(&mut pdu).await.map_err(io_failure)?;
        match decode_pdu(&pdu, req) {
            Ok(Response::Exception(code)) => Err(PollFailure::Exception(code)),
            Ok(resp) => Ok(resp),
            Err(e) => Err(PollFailure::Transport(e.to_string())),
        }
    }

    async fn transact_rtu(&mut self, req: &ReadRequest) -> Result<Response, PollFailure> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        let frame = encode_request_rtu(req);
        stream.write_all(&frame).await.map_err(io_failure)?;

        // unit id + function code decide how much more to read.
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.map_err(io_failure)?;
        let mut full = head.to_vec();
        if head[1] & 0x80 != 0 {
            let mut rest = [0u8; 3];
            stream.read_exact(&mut rest).await.map_err(io_failure)?;
            full.extend_from_slice(&rest);
        } else {
            let mut count = [0u8; 1];
            stream.read_exact(&mut count).await.map_err(io_failure)?;
            full.push(count[0]);
            let mut rest = vec![0u8; count[0] as usize + 2];
            stream.read_exact(&mut rest).await.map_err(io_failure)?;
            full.extend_from_slice(&rest);
        }

        match decode_response_rtu(&full, req) {
            Ok(Response::Exception(code)) => Err(PollFailure::Exception(code)),
            Ok(resp) => Ok(resp),
            Err(e) => Err(PollFailure::Transport(e.to_string())),
        }
    }

    async fn poll_block(&mut self, block: &RegisterBlock) -> Result<Vec<CanonicalRecord>, PollFailure> {
        let req = ReadRequest {
            unit_id: self.opts.unit_id,
            reg_type: block.reg_type,
            address: block.address,
            count: block.count,
        };
        let response = self.transact(&req).await?;
        Ok(self.records_from(block, response))
    }

    fn records_from(&self, block: &RegisterBlock, response: Response) -> Vec<CanonicalRecord> {
        let now = unix_micros_now();
        let label = block.label();
        let type_name = register_type_name(block);
        match response {
            Response::Registers(words) => {
                let width = block.data_type.width();
                codec::decode_words(&words, block.data_type, self.opts.word_order)
                    .into_iter()
                    .enumerate()
                    .map(|(i, decoded)| {
                        let address = block.address + i as u16 * width;
                        let (value, raw) = match decoded {
                            Decoded::Int(v) => {
                                let scaled = v as f64 * block.scale + block.offset;
                                (Value::Float(scaled), v)
                            }
                            Decoded::Float(f) => {
                                (Value::Float(f * block.scale + block.offset), 0)
                            }
                            Decoded::Bool(b) => (Value::Bool(b), b as i64),
                        };
                        self.record(&label, type_name, address, now, value)
                            .with_value_type(data_type_name(block))
                            .with_meta("raw_value", raw)
                            .with_meta("scale", block.scale)
                            .with_meta("offset", block.offset)
                    })
                    .collect()
            }
            Response::Bits(bits) => bits
                .into_iter()
                .enumerate()
                .map(|(i, bit)| {
                    let address = block.address + i as u16;
                    self.record(&label, type_name, address, now, Value::Bool(bit))
                        .with_value_type("Bool")
                        .with_meta("raw_value", bit as i64)
                })
                .collect(),
            Response::Exception(_) => Vec::new(),
        }
    }

    fn record(
        &self,
        label: &str,
        type_name: &str,
        address: u16,
        event_time_us: i64,
        value: Value,
    ) -> CanonicalRecord {
        CanonicalRecord::new(
            self.source_name.clone(),
            self.endpoint.clone(),
            ProtocolKind::Modbus,
            format!("{label}/{type_name}/{address}"),
            event_time_us,
            value,
        )
        .with_meta("register_type", type_name)
        .with_meta("address", address as i64)
        .with_meta("unit_id", self.opts.unit_id as i64)
    }

    fn failure_record(&self, block: &RegisterBlock, failure: &PollFailure) -> CanonicalRecord {
        let (status, code, reason) = match failure {
            PollFailure::Exception(code) => {
                (Quality::Bad, *code as u32, format!("modbus exception 0x{code:02x}"))
            }
            PollFailure::Timeout => (Quality::Uncertain, 0, "poll timed out".to_string()),
            PollFailure::Transport(msg) => (Quality::Bad, 0, msg.clone()),
        };
        self.record(
            &block.label(),
            register_type_name(block),
            block.address,
            unix_micros_now(),
            Value::Null,
        )
        .with_status(status, code)
        .with_meta("reason", reason)
    }
}

fn not_connected() -> PollFailure {
    PollFailure::Transport("not connected".to_string())
}

fn io_failure(e: std::io::Error) -> PollFailure {
    PollFailure::Transport(e.to_string())
}

fn register_type_name(block: &RegisterBlock) -> &'static str {
    match block.reg_type {
        crate::config::RegisterType::Holding => "holding",
        crate::config::RegisterType::Input => "input",
        crate::config::RegisterType::Coil => "coil",
        crate::config::RegisterType::Discrete => "discrete",
    }
}

fn data_type_name(block: &RegisterBlock) -> &'static str {
    match block.data_type {
        crate::config::DataType::Int16 => "Int16",
        crate::config::DataType::Uint16 => "Uint16",
        crate::config::DataType::Int32 => "Int32",
        crate::config::DataType::Uint32 => "Uint32",
        crate::config::DataType::Float32 => "Float32",
        crate::config::DataType::Bool => "Bool",
    }
}

fn parse_endpoint(endpoint: &str) -> (Framing, String) {
    let endpoint = endpoint.trim();
    let (framing, rest) = if let Some(rest) = endpoint.strip_prefix("modbusrtu://") {
        (Framing::Rtu, rest)
    } else if let Some(rest) = endpoint.strip_prefix("modbus://") {
        (Framing::Tcp, rest)
    } else {
        (Framing::Tcp, endpoint)
    };
    let addr = if rest.contains(':') {
        rest.to_string()
    } else {
        format!("{rest}:{DEFAULT_PORT}")
    };
    (framing, addr)
}

#[async_trait]
impl ProtocolClient for ModbusClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Modbus
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let connect = TcpStream::connect(&self.addr);
        let stream = tokio::time::timeout(self.timeout(), connect)
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout()))?
            .map_err(|e| ProtocolError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        tracing::info!(source = %self.source_name, addr = %self.addr, framing = ?self.framing, "modbus connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn run(
        &mut self,
        ingress: Ingress,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        if self.stream.is_none() {
            return Err(ProtocolError::Fatal("run() before connect()".into()));
        }
        let interval = Duration::from_millis(self.opts.poll_interval_ms.max(1));

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let blocks = self.opts.registers.clone();
            for block in &blocks {
                if *stop.borrow() {
                    return Ok(());
                }
                match self.poll_block(block).await {
                    Ok(records) => {
                        for record in records {
                            if !ingress.emit(record).await {
                                return Ok(());
                            }
                        }
                    }
                    Err(PollFailure::Transport(msg)) => {
                        // The wire is broken or desynced; reconnect fresh.
                        return Err(ProtocolError::SubscriptionLost(msg));
                    }
                    Err(failure) => {
                        let record = self.failure_record(block, &failure);
                        tracing::warn!(
                            source = %self.source_name,
                            block = %block.label(),
                            status = %record.status,
                            "modbus poll failed"
                        );
                        if !ingress.emit(record).await {
                            return Ok(());
                        }
                    }
                }
            }

            self.polls_completed += 1;
            if self.polls_completed % 10 == 0 {
                tracing::debug!(
                    source = %self.source_name,
                    polls = self.polls_completed,
                    "modbus polling"
                );
            }

            tokio::select! {
                _ = wait_for_stop(&mut stop) => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn test_connection(&mut self) -> TestReport {
        let started = Instant::now();
        let mut server_info = BTreeMap::new();
        server_info.insert("transport".to_string(), format!("{:?}", self.framing).to_lowercase());
        server_info.insert("address".to_string(), self.addr.clone());
        server_info.insert("unit_id".to_string(), self.opts.unit_id.to_string());

        let result = async {
            self.connect().await?;
            let probe = ReadRequest {
                unit_id: self.opts.unit_id,
                reg_type: crate::config::RegisterType::Holding,
                address: 0,
                count: 1,
            };
            match self.transact(&probe).await {
                Ok(_) => {
                    server_info.insert("test_read".to_string(), "ok".to_string());
                }
                Err(PollFailure::Exception(code)) => {
                    // Device answered; it just dislikes register 0.
                    server_info
                        .insert("test_read".to_string(), format!("exception 0x{code:02x}"));
                }
                Err(PollFailure::Timeout) => {
                    return Err(ProtocolError::Timeout(self.timeout()));
                }
                Err(PollFailure::Transport(msg)) => {
                    return Err(ProtocolError::SubscriptionLost(msg));
                }
            }
            Ok(())
        }
        .await;

        self.disconnect().await;
        TestReport {
            ok: result.is_ok(),
            endpoint: self.endpoint.clone(),
            protocol: ProtocolKind::Modbus,
            duration_ms: started.elapsed().as_millis() as u64,
            server_info,
            error: result.err().map(|e| e.to_string()),
        }
    }
}
