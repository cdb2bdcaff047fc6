//! Generated wire-protocol types and helpers for the TekHSI gRPC surface.

/// Protocol Buffer definitions generated from `proto/tekhsi.proto`.
pub mod proto {
    tonic::include_proto!("tekhsi");
}

pub use proto::connect_client::ConnectClient;
pub use proto::waveform_data_client::WaveformDataClient;
pub use proto::{
    AvailableNamesReply, ConnectReply, ConnectRequest, ConnectStatus, NormalizedReply, RawReply,
    WaveformHeader, WaveformRequest, WfmPairType, WfmReplyStatus, WfmType,
};

impl WaveformHeader {
    /// True for the interleaved I/Q waveform kinds.
    pub fn is_iq(&self) -> bool {
        matches!(self.wfmtype(), WfmType::Analog16Iq | WfmType::Analog32Iq)
    }

    /// True for the digital-probe waveform kinds.
    pub fn is_digital(&self) -> bool {
        matches!(self.wfmtype(), WfmType::Digital8 | WfmType::Digital16)
    }

    /// True for the scalar analog waveform kinds.
    pub fn is_analog(&self) -> bool {
        matches!(
            self.wfmtype(),
            WfmType::Analog8 | WfmType::Analog16 | WfmType::AnalogFloat
        )
    }

    /// Bytes occupied by one sample in the native layout. I/Q samples carry
    /// two interleaved lanes, doubling the per-sample size.
    pub fn element_size(&self) -> usize {
        let width = self.sourcewidth.max(0) as usize;
        if self.is_iq() {
            width * 2
        } else {
            width
        }
    }

    /// Exact byte length of the assembled native sample array.
    pub fn expected_byte_len(&self) -> usize {
        if !self.hasdata {
            return 0;
        }
        self.noofsamples as usize * self.element_size()
    }

    /// Exact float count of the assembled normalized sample array.
    pub fn expected_sample_len(&self) -> usize {
        if !self.hasdata {
            return 0;
        }
        let lanes = if self.is_iq() { 2 } else { 1 };
        self.noofsamples as usize * lanes
    }

    /// A header describes a fetchable waveform when it has a known sample
    /// width and a positive sample count.
    pub fn is_valid(&self) -> bool {
        self.noofsamples > 0 && matches!(self.sourcewidth, 1 | 2 | 4)
    }
}
