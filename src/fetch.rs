//! Streaming fetcher: pulls one symbol's header + sample chunks and
//! assembles them into a typed waveform.
//!
//! Stream contract: the first message must carry the header; every following
//! message carries a sample chunk; a message with a failure status aborts the
//! fetch. The assembled payload must match the size announced by the header
//! exactly.

use crate::config::Encoding;
use crate::error::{Result, TekHsiError};
use crate::grpc::proto::{normalized_reply, raw_reply};
use crate::grpc::{
    NormalizedReply, RawReply, WaveformDataClient, WaveformHeader, WaveformRequest, WfmReplyStatus,
    WfmType,
};
use crate::waveform::{
    AnalogSamples, AnalogWaveform, DigitalSamples, DigitalWaveform, HorizontalScale, IqMeta,
    IqSamples, IqWaveform, Waveform,
};
use num_complex::Complex;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;
use tracing::debug;

/// One fetched symbol: the acquisition header and the assembled record.
#[derive(Debug, Clone)]
pub(crate) struct SymbolFetch {
    pub header: WaveformHeader,
    pub waveform: Waveform,
}

/// Fetch one symbol with the configured encoding.
pub(crate) async fn fetch_symbol(
    client: &mut WaveformDataClient<Channel>,
    symbol: &str,
    chunk_size: u32,
    encoding: Encoding,
) -> Result<SymbolFetch> {
    debug!(symbol, ?encoding, "fetching waveform");
    let request = WaveformRequest {
        sourcename: symbol.to_string(),
        chunksize: chunk_size,
    };
    match encoding {
        Encoding::Raw => {
            let stream = client.get_raw_waveform(request).await?.into_inner();
            let (header, bytes) = assemble_raw(symbol, stream).await?;
            let waveform = build_raw(&header, bytes)?;
            Ok(SymbolFetch { header, waveform })
        }
        Encoding::Normalized => {
            let stream = client.get_waveform(request).await?.into_inner();
            let (header, samples) = assemble_normalized(symbol, stream).await?;
            let waveform = build_normalized(&header, samples)?;
            Ok(SymbolFetch { header, waveform })
        }
    }
}

fn check_status(symbol: &str, status: WfmReplyStatus) -> Result<()> {
    match status {
        // chunk messages leave the status at its default
        WfmReplyStatus::Success | WfmReplyStatus::Unspecified => Ok(()),
        status => Err(TekHsiError::Stream {
            symbol: symbol.to_string(),
            status,
        }),
    }
}

/// Assemble a native-encoding stream into the header and its byte payload.
pub(crate) async fn assemble_raw<S>(symbol: &str, mut stream: S) -> Result<(WaveformHeader, Vec<u8>)>
where
    S: Stream<Item = std::result::Result<RawReply, tonic::Status>> + Unpin,
{
    let mut header: Option<WaveformHeader> = None;
    let mut buffer: Vec<u8> = Vec::new();
    let mut filled = 0usize;

    while let Some(reply) = stream.next().await {
        let reply = reply?;
        check_status(symbol, reply.status())?;
        match reply.headerordata {
            Some(raw_reply::Headerordata::Header(h)) => {
                if header.is_some() {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': second header in one stream"
                    )));
                }
                buffer = vec![0u8; h.expected_byte_len()];
                header = Some(h);
            }
            Some(raw_reply::Headerordata::Chunk(chunk)) => {
                if header.is_none() {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': chunk received before header"
                    )));
                }
                let end = filled + chunk.data.len();
                if end > buffer.len() {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': sample stream overflows announced size by {} bytes",
                        end - buffer.len()
                    )));
                }
                buffer[filled..end].copy_from_slice(&chunk.data);
                filled = end;
            }
            // status-only trailer
            None => {}
        }
    }

    let header = header.ok_or_else(|| {
        TekHsiError::Protocol(format!("'{symbol}': stream ended without a header"))
    })?;
    if filled != buffer.len() {
        return Err(TekHsiError::Protocol(format!(
            "'{symbol}': sample stream short by {} bytes",
            buffer.len() - filled
        )));
    }
    Ok((header, buffer))
}

/// Assemble a normalized-encoding stream into the header and its floats.
pub(crate) async fn assemble_normalized<S>(
    symbol: &str,
    mut stream: S,
) -> Result<(WaveformHeader, Vec<f32>)>
where
    S: Stream<Item = std::result::Result<NormalizedReply, tonic::Status>> + Unpin,
{
    let mut header: Option<WaveformHeader> = None;
    let mut buffer: Vec<f32> = Vec::new();
    let mut expected = 0usize;

    while let Some(reply) = stream.next().await {
        let reply = reply?;
        check_status(symbol, reply.status())?;
        match reply.headerordata {
            Some(normalized_reply::Headerordata::Header(h)) => {
                if header.is_some() {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': second header in one stream"
                    )));
                }
                expected = h.expected_sample_len();
                buffer.reserve_exact(expected);
                header = Some(h);
            }
            Some(normalized_reply::Headerordata::Chunk(chunk)) => {
                if header.is_none() {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': chunk received before header"
                    )));
                }
                if buffer.len() + chunk.data.len() > expected {
                    return Err(TekHsiError::Protocol(format!(
                        "'{symbol}': sample stream overflows announced size by {} samples",
                        buffer.len() + chunk.data.len() - expected
                    )));
                }
                buffer.extend_from_slice(&chunk.data);
            }
            None => {}
        }
    }

    let header = header.ok_or_else(|| {
        TekHsiError::Protocol(format!("'{symbol}': stream ended without a header"))
    })?;
    if buffer.len() != expected {
        return Err(TekHsiError::Protocol(format!(
            "'{symbol}': sample stream short by {} samples",
            expected - buffer.len()
        )));
    }
    Ok((header, buffer))
}

fn horizontal_scale(header: &WaveformHeader) -> HorizontalScale {
    HorizontalScale {
        spacing: header.horizontalspacing,
        zero_index: header.horizontalzeroindex,
        fractional_zero_index: header.horizontalfractionalzeroindex,
        units: header.horizontalunits.clone(),
    }
}

fn lanes_of<T: Copy, const N: usize>(
    header: &WaveformHeader,
    bytes: &[u8],
    decode: fn([u8; N]) -> T,
) -> Result<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(TekHsiError::Protocol(format!(
            "'{}': payload of {} bytes does not divide into {}-byte samples",
            header.sourcename,
            bytes.len(),
            N
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|c| {
            let mut lane = [0u8; N];
            lane.copy_from_slice(c);
            decode(lane)
        })
        .collect())
}

fn complex_pairs<T: Copy>(lanes: Vec<T>) -> Vec<Complex<T>> {
    lanes
        .chunks_exact(2)
        .map(|p| Complex::new(p[0], p[1]))
        .collect()
}

/// Build the typed waveform for a native-encoding payload.
pub(crate) fn build_raw(header: &WaveformHeader, bytes: Vec<u8>) -> Result<Waveform> {
    let horizontal = horizontal_scale(header);
    let waveform = match header.wfmtype() {
        WfmType::Analog8 => Waveform::Analog(analog(
            header,
            horizontal,
            AnalogSamples::Int8(bytes.into_iter().map(|b| b as i8).collect()),
        )),
        WfmType::Analog16 => Waveform::Analog(analog(
            header,
            horizontal,
            AnalogSamples::Int16(lanes_of(header, &bytes, i16::from_le_bytes)?),
        )),
        WfmType::AnalogFloat => Waveform::Analog(analog(
            header,
            horizontal,
            AnalogSamples::Float32(lanes_of(header, &bytes, f32::from_le_bytes)?),
        )),
        WfmType::Analog16Iq => Waveform::Iq(iq(
            header,
            horizontal,
            IqSamples::Int16(complex_pairs(lanes_of(header, &bytes, i16::from_le_bytes)?)),
        )),
        WfmType::Analog32Iq => Waveform::Iq(iq(
            header,
            horizontal,
            IqSamples::Int32(complex_pairs(lanes_of(header, &bytes, i32::from_le_bytes)?)),
        )),
        WfmType::Digital8 => Waveform::Digital(digital(
            header,
            horizontal,
            DigitalSamples::Int8(bytes),
        )),
        WfmType::Digital16 => Waveform::Digital(digital(
            header,
            horizontal,
            DigitalSamples::Int16(lanes_of(header, &bytes, u16::from_le_bytes)?),
        )),
        WfmType::Unspecified => {
            return Err(TekHsiError::Protocol(format!(
                "'{}': header carries no waveform type",
                header.sourcename
            )))
        }
    };
    Ok(waveform)
}

/// Build the typed waveform for a normalized-encoding payload.
pub(crate) fn build_normalized(header: &WaveformHeader, samples: Vec<f32>) -> Result<Waveform> {
    let horizontal = horizontal_scale(header);
    let waveform = match header.wfmtype() {
        WfmType::Analog8 | WfmType::Analog16 | WfmType::AnalogFloat => Waveform::Analog(analog(
            header,
            horizontal,
            AnalogSamples::Float32(samples),
        )),
        WfmType::Analog16Iq | WfmType::Analog32Iq => Waveform::Iq(iq(
            header,
            horizontal,
            IqSamples::Float32(complex_pairs(samples)),
        )),
        WfmType::Digital8 | WfmType::Digital16 => {
            return Err(TekHsiError::Protocol(format!(
                "'{}': digital sources are only available via the raw encoding",
                header.sourcename
            )))
        }
        WfmType::Unspecified => {
            return Err(TekHsiError::Protocol(format!(
                "'{}': header carries no waveform type",
                header.sourcename
            )))
        }
    };
    Ok(waveform)
}

fn analog(
    header: &WaveformHeader,
    horizontal: HorizontalScale,
    samples: AnalogSamples,
) -> AnalogWaveform {
    AnalogWaveform {
        source_name: header.sourcename.clone(),
        horizontal,
        y_spacing: header.verticalspacing,
        y_offset: header.verticaloffset,
        y_units: header.verticalunits.clone(),
        samples,
    }
}

fn iq(header: &WaveformHeader, horizontal: HorizontalScale, samples: IqSamples) -> IqWaveform {
    IqWaveform {
        source_name: header.sourcename.clone(),
        horizontal,
        iq_spacing: header.verticalspacing,
        iq_offset: header.verticaloffset,
        iq_units: header.verticalunits.clone(),
        meta: IqMeta::derive(
            header.iq_centerfrequency,
            header.iq_fftlength,
            header.iq_rbw,
            header.iq_span,
            &header.iq_windowtype,
        ),
        samples,
    }
}

fn digital(
    header: &WaveformHeader,
    horizontal: HorizontalScale,
    samples: DigitalSamples,
) -> DigitalWaveform {
    DigitalWaveform {
        source_name: header.sourcename.clone(),
        horizontal,
        bitmask: header.bitmask,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::WfmPairType;
    use tokio_stream::iter;

    fn header(wfmtype: WfmType, width: i32, samples: u64) -> WaveformHeader {
        WaveformHeader {
            sourcename: "ch1".to_string(),
            sourcewidth: width,
            wfmtype: wfmtype.into(),
            pairtype: if matches!(wfmtype, WfmType::Analog16Iq | WfmType::Analog32Iq) {
                WfmPairType::Pair.into()
            } else {
                WfmPairType::None.into()
            },
            transid: 1,
            dataid: 1,
            noofsamples: samples,
            horizontalspacing: 1e-9,
            verticalspacing: 0.01,
            verticalunits: "V".to_string(),
            horizontalunits: "s".to_string(),
            hasdata: true,
            ..Default::default()
        }
    }

    fn header_reply(h: WaveformHeader) -> RawReply {
        RawReply {
            status: WfmReplyStatus::Success.into(),
            headerordata: Some(raw_reply::Headerordata::Header(h)),
        }
    }

    fn chunk_reply(data: Vec<u8>) -> RawReply {
        RawReply {
            status: WfmReplyStatus::Unspecified.into(),
            headerordata: Some(raw_reply::Headerordata::Chunk(
                raw_reply::WaveformSampleByteChunk { data },
            )),
        }
    }

    #[tokio::test]
    async fn assembles_single_chunk_analog_record() {
        let replies = vec![
            Ok(header_reply(header(WfmType::Analog16, 2, 10))),
            Ok(chunk_reply(vec![0u8; 20])),
        ];
        let (h, bytes) = assemble_raw("ch1", iter(replies)).await.unwrap();
        assert_eq!(bytes.len(), 20);

        let wfm = build_raw(&h, bytes).unwrap();
        assert_eq!(wfm.record_length(), 10);
        assert!(wfm.as_analog().is_some());
    }

    #[tokio::test]
    async fn assembles_split_chunks_at_their_offsets() {
        let replies = vec![
            Ok(header_reply(header(WfmType::Analog16, 2, 4))),
            Ok(chunk_reply(vec![1, 0, 2, 0])),
            Ok(chunk_reply(vec![3, 0, 4, 0])),
        ];
        let (h, bytes) = assemble_raw("ch1", iter(replies)).await.unwrap();
        let wfm = build_raw(&h, bytes).unwrap();
        match &wfm.as_analog().unwrap().samples {
            AnalogSamples::Int16(v) => assert_eq!(v, &vec![1, 2, 3, 4]),
            other => panic!("expected 16-bit lanes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_before_header_is_a_protocol_error() {
        let replies = vec![Ok(chunk_reply(vec![0u8; 4]))];
        let err = assemble_raw("ch1", iter(replies)).await.unwrap_err();
        assert!(matches!(err, TekHsiError::Protocol(_)));
        assert!(err.to_string().contains("before header"));
    }

    #[tokio::test]
    async fn short_stream_reports_the_missing_bytes() {
        let replies = vec![
            Ok(header_reply(header(WfmType::Analog16, 2, 10))),
            Ok(chunk_reply(vec![0u8; 12])),
        ];
        let err = assemble_raw("ch1", iter(replies)).await.unwrap_err();
        assert!(err.to_string().contains("short by 8 bytes"));
    }

    #[tokio::test]
    async fn overflowing_stream_reports_the_excess() {
        let replies = vec![
            Ok(header_reply(header(WfmType::Analog16, 2, 2))),
            Ok(chunk_reply(vec![0u8; 6])),
        ];
        let err = assemble_raw("ch1", iter(replies)).await.unwrap_err();
        assert!(err.to_string().contains("overflows announced size by 2 bytes"));
    }

    #[tokio::test]
    async fn no_data_header_yields_empty_record() {
        let mut h = header(WfmType::Analog16, 2, 10);
        h.hasdata = false;
        let replies = vec![Ok(header_reply(h))];
        let (h, bytes) = assemble_raw("ch1", iter(replies)).await.unwrap();
        assert!(bytes.is_empty());
        let wfm = build_raw(&h, bytes).unwrap();
        assert_eq!(wfm.record_length(), 0);
    }

    #[tokio::test]
    async fn failure_status_aborts_the_fetch() {
        let reply = RawReply {
            status: WfmReplyStatus::Sourcenamemissing.into(),
            headerordata: None,
        };
        let err = assemble_raw("ch9", iter(vec![Ok(reply)])).await.unwrap_err();
        assert!(matches!(
            err,
            TekHsiError::Stream {
                status: WfmReplyStatus::Sourcenamemissing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn iq_pairs_become_complex_entries() {
        // 4 complex samples, 2-byte lanes: 16 bytes on the wire
        let mut h = header(WfmType::Analog16Iq, 2, 4);
        h.iq_windowtype = "Hanning".to_string();
        h.iq_fftlength = 1024.0;
        h.iq_rbw = 1e3;
        let payload: Vec<u8> = [1i16, 2, 3, 4, 5, 6, 7, 8]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(payload.len(), 16);

        let replies = vec![Ok(header_reply(h)), Ok(chunk_reply(payload))];
        let (h, bytes) = assemble_raw("ch1_iq", iter(replies)).await.unwrap();
        let wfm = build_raw(&h, bytes).unwrap();

        let iq = wfm.as_iq().unwrap();
        assert_eq!(iq.record_length(), 4);
        match &iq.samples {
            IqSamples::Int16(v) => {
                assert_eq!(v[0], Complex::new(1, 2));
                assert_eq!(v[3], Complex::new(7, 8));
            }
            other => panic!("expected 16-bit lanes, got {other:?}"),
        }
        assert!(iq.meta.sample_rate > 0.0);
    }

    #[tokio::test]
    async fn digital_record_keeps_raw_slots() {
        let mut h = header(WfmType::Digital8, 1, 3);
        h.bitmask = 0b1111;
        let replies = vec![Ok(header_reply(h)), Ok(chunk_reply(vec![0b0001, 0b0010, 0b0100]))];
        let (h, bytes) = assemble_raw("ch4_DAll", iter(replies)).await.unwrap();
        let wfm = build_raw(&h, bytes).unwrap();

        let digital = wfm.as_digital().unwrap();
        assert_eq!(digital.record_length(), 3);
        assert_eq!(digital.bit(0, 0), Some(true));
        assert_eq!(digital.bit(1, 1), Some(true));
        assert_eq!(digital.bit(2, 1), Some(false));
    }

    #[test]
    fn normalized_floats_stay_normalized() {
        let h = header(WfmType::Analog16, 2, 3);
        let wfm = build_normalized(&h, vec![0.1, 0.2, 0.3]).unwrap();
        match &wfm.as_analog().unwrap().samples {
            AnalogSamples::Float32(v) => assert_eq!(v.len(), 3),
            other => panic!("expected floats, got {other:?}"),
        }
    }

    #[test]
    fn normalized_digital_is_rejected() {
        let h = header(WfmType::Digital8, 1, 3);
        let err = build_normalized(&h, vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, TekHsiError::Protocol(_)));
    }
}
