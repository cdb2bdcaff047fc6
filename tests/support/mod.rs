//! In-process TekHSI streaming server for integration tests.
//!
//! Serves scripted acquisitions over real gRPC on a loopback port. Tests
//! drive the instrument side through [`ScopeState`]: publishing symbol
//! sets, advancing the acquisition id, and injecting mid-fetch races.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tekhsi::grpc::proto::connect_server::{Connect, ConnectServer};
use tekhsi::grpc::proto::waveform_data_server::{WaveformData, WaveformDataServer};
use tekhsi::grpc::proto::{normalized_reply, raw_reply};
use tekhsi::grpc::{
    AvailableNamesReply, ConnectReply, ConnectRequest, ConnectStatus, NormalizedReply, RawReply,
    WaveformHeader, WaveformRequest, WfmPairType, WfmReplyStatus, WfmType,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// One symbol's scripted data.
#[derive(Debug, Clone)]
pub struct TestWaveform {
    pub wfm_type: WfmType,
    pub source_width: i32,
    pub sample_count: u64,
    pub raw: Vec<u8>,
    pub vertical_spacing: f64,
    pub vertical_offset: f64,
    pub horizontal_spacing: f64,
    pub zero_index: f64,
    pub bitmask: u32,
}

impl TestWaveform {
    /// 16-bit analog ramp: sample i has raw value i.
    pub fn analog16(sample_count: usize) -> Self {
        let raw = (0..sample_count)
            .flat_map(|i| (i as i16).to_le_bytes())
            .collect();
        Self {
            wfm_type: WfmType::Analog16,
            source_width: 2,
            sample_count: sample_count as u64,
            raw,
            vertical_spacing: 0.01,
            vertical_offset: 0.0,
            horizontal_spacing: 1e-9,
            zero_index: sample_count as f64 / 2.0,
            bitmask: 0,
        }
    }

    /// 16-bit I/Q record with `pairs` complex samples: pair i is (2i, 2i+1).
    pub fn analog16_iq(pairs: usize) -> Self {
        let raw = (0..pairs * 2)
            .flat_map(|i| (i as i16).to_le_bytes())
            .collect();
        Self {
            wfm_type: WfmType::Analog16Iq,
            source_width: 2,
            sample_count: pairs as u64,
            raw,
            vertical_spacing: 0.001,
            vertical_offset: 0.0,
            horizontal_spacing: 1e-6,
            zero_index: 0.0,
            bitmask: 0,
        }
    }

    /// 8-bit digital record from the given slots.
    pub fn digital8(slots: &[u8], bitmask: u32) -> Self {
        Self {
            wfm_type: WfmType::Digital8,
            source_width: 1,
            sample_count: slots.len() as u64,
            raw: slots.to_vec(),
            vertical_spacing: 1.0,
            vertical_offset: 0.0,
            horizontal_spacing: 1e-9,
            zero_index: 0.0,
            bitmask,
        }
    }

    fn header(&self, name: &str, trans_id: u64, chunk_size: u32) -> WaveformHeader {
        WaveformHeader {
            sourcename: name.to_string(),
            sourcewidth: self.source_width,
            dataid: trans_id,
            transid: trans_id,
            wfmtype: self.wfm_type.into(),
            pairtype: if matches!(self.wfm_type, WfmType::Analog16Iq | WfmType::Analog32Iq) {
                WfmPairType::Pair.into()
            } else {
                WfmPairType::None.into()
            },
            noofsamples: self.sample_count,
            horizontalspacing: self.horizontal_spacing,
            horizontalzeroindex: self.zero_index,
            horizontalfractionalzeroindex: 0.0,
            horizontalunits: "s".to_string(),
            verticalspacing: self.vertical_spacing,
            verticaloffset: self.vertical_offset,
            verticalunits: "V".to_string(),
            bitmask: self.bitmask,
            chunksize: chunk_size,
            hasdata: self.sample_count > 0,
            ..Default::default()
        }
    }
}

struct ScopeInner {
    trans_id: u64,
    symbols: BTreeMap<String, TestWaveform>,
    race_bumps: u32,
}

/// Test-side handle onto the scripted instrument state.
#[derive(Clone)]
pub struct ScopeState {
    inner: Arc<Mutex<ScopeInner>>,
}

impl Default for ScopeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeInner {
                trans_id: 0,
                symbols: BTreeMap::new(),
                race_bumps: 0,
            })),
        }
    }

    /// Replace the advertised symbol set and set the acquisition id.
    pub fn publish(&self, trans_id: u64, symbols: Vec<(&str, TestWaveform)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.trans_id = trans_id;
        inner.symbols = symbols
            .into_iter()
            .map(|(name, wfm)| (name.to_lowercase(), wfm))
            .collect();
    }

    /// A new acquisition with unchanged data.
    pub fn advance(&self) {
        self.inner.lock().unwrap().trans_id += 1;
    }

    /// Bump the acquisition id after each of the next `n` header serves,
    /// simulating the instrument re-triggering mid-fetch.
    pub fn race_bumps(&self, n: u32) {
        self.inner.lock().unwrap().race_bumps = n;
    }

    fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().symbols.keys().cloned().collect()
    }

    fn raw_replies(&self, name: &str, chunk_size: usize) -> Vec<Result<RawReply, Status>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(wfm) = inner.symbols.get(&name.to_lowercase()).cloned() else {
            return vec![Ok(RawReply {
                status: WfmReplyStatus::Sourcenamemissing.into(),
                headerordata: None,
            })];
        };
        let header = wfm.header(name, inner.trans_id, chunk_size as u32);
        if inner.race_bumps > 0 {
            inner.trans_id += 1;
            inner.race_bumps -= 1;
        }
        drop(inner);

        let mut replies = vec![Ok(RawReply {
            status: WfmReplyStatus::Success.into(),
            headerordata: Some(raw_reply::Headerordata::Header(header)),
        })];
        replies.extend(wfm.raw.chunks(chunk_size.max(1)).map(|chunk| {
            Ok(RawReply {
                status: WfmReplyStatus::Unspecified.into(),
                headerordata: Some(raw_reply::Headerordata::Chunk(
                    raw_reply::WaveformSampleByteChunk {
                        data: chunk.to_vec(),
                    },
                )),
            })
        }));
        replies.push(Ok(RawReply {
            status: WfmReplyStatus::Success.into(),
            headerordata: None,
        }));
        replies
    }

    fn normalized_replies(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> Vec<Result<NormalizedReply, Status>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(wfm) = inner.symbols.get(&name.to_lowercase()).cloned() else {
            return vec![Ok(NormalizedReply {
                status: WfmReplyStatus::Sourcenamemissing.into(),
                headerordata: None,
            })];
        };
        let floats: Vec<f32> = match wfm.wfm_type {
            WfmType::Analog8 => wfm
                .raw
                .iter()
                .map(|&b| f32::from(b as i8) * wfm.vertical_spacing as f32)
                .collect(),
            WfmType::Analog16 => wfm
                .raw
                .chunks_exact(2)
                .map(|c| {
                    f32::from(i16::from_le_bytes([c[0], c[1]])) * wfm.vertical_spacing as f32
                        + wfm.vertical_offset as f32
                })
                .collect(),
            _ => {
                return vec![Ok(NormalizedReply {
                    status: WfmReplyStatus::Typemismatch.into(),
                    headerordata: None,
                })]
            }
        };

        let mut header = wfm.header(name, inner.trans_id, chunk_size as u32);
        header.sourcewidth = 4;
        header.verticalspacing = 1.0;
        header.verticaloffset = 0.0;
        if inner.race_bumps > 0 {
            inner.trans_id += 1;
            inner.race_bumps -= 1;
        }
        drop(inner);

        let mut replies = vec![Ok(NormalizedReply {
            status: WfmReplyStatus::Success.into(),
            headerordata: Some(normalized_reply::Headerordata::Header(header)),
        })];
        replies.extend(floats.chunks((chunk_size / 4).max(1)).map(|chunk| {
            Ok(NormalizedReply {
                status: WfmReplyStatus::Unspecified.into(),
                headerordata: Some(normalized_reply::Headerordata::Chunk(
                    normalized_reply::WaveformSampleChunk {
                        data: chunk.to_vec(),
                    },
                )),
            })
        }));
        replies.push(Ok(NormalizedReply {
            status: WfmReplyStatus::Success.into(),
            headerordata: None,
        }));
        replies
    }
}

struct ConnectSvc {
    state: ScopeState,
}

fn ok_reply() -> Response<ConnectReply> {
    Response::new(ConnectReply {
        status: ConnectStatus::Success.into(),
    })
}

#[tonic::async_trait]
impl Connect for ConnectSvc {
    async fn connect(
        &self,
        _request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectReply>, Status> {
        Ok(ok_reply())
    }

    async fn disconnect(
        &self,
        _request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectReply>, Status> {
        Ok(ok_reply())
    }

    async fn keep_alive(
        &self,
        _request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectReply>, Status> {
        Ok(ok_reply())
    }

    async fn available_names(
        &self,
        _request: Request<ConnectRequest>,
    ) -> Result<Response<AvailableNamesReply>, Status> {
        Ok(Response::new(AvailableNamesReply {
            status: ConnectStatus::Success.into(),
            symbolnames: self.state.names(),
        }))
    }

    async fn request_new_sequence(
        &self,
        _request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectReply>, Status> {
        // behave like a single-sequence instrument: produce a fresh acquisition
        self.state.advance();
        Ok(ok_reply())
    }
}

struct DataSvc {
    state: ScopeState,
}

type ReplyStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl WaveformData for DataSvc {
    type GetWaveformStream = ReplyStream<NormalizedReply>;
    type GetRawWaveformStream = ReplyStream<RawReply>;

    async fn get_waveform(
        &self,
        request: Request<WaveformRequest>,
    ) -> Result<Response<Self::GetWaveformStream>, Status> {
        let req = request.into_inner();
        let replies = self
            .state
            .normalized_replies(&req.sourcename, req.chunksize as usize);
        Ok(Response::new(Box::pin(tokio_stream::iter(replies))))
    }

    async fn get_raw_waveform(
        &self,
        request: Request<WaveformRequest>,
    ) -> Result<Response<Self::GetRawWaveformStream>, Status> {
        let req = request.into_inner();
        let replies = self
            .state
            .raw_replies(&req.sourcename, req.chunksize as usize);
        Ok(Response::new(Box::pin(tokio_stream::iter(replies))))
    }
}

/// A running loopback server plus its control handle.
pub struct TestServer {
    pub url: String,
    pub scope: ScopeState,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(scope: ScopeState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = tokio::sync::oneshot::channel::<()>();

        let connect_svc = ConnectServer::new(ConnectSvc {
            state: scope.clone(),
        });
        let data_svc = WaveformDataServer::new(DataSvc {
            state: scope.clone(),
        });
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(connect_svc)
                .add_service(data_svc)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            scope,
            shutdown: Some(shutdown),
            handle,
        }
    }

    /// Stop serving; established client calls start failing.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.handle.await;
    }
}
