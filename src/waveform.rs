//! Typed waveform value objects produced by the acquisition pipeline.
//!
//! A fetched symbol becomes one of three concrete shapes depending on the
//! header's waveform kind: scalar analog, interleaved I/Q, or digital.
//! Sample arrays are stored the way they arrived; vertical scaling is
//! attached but not pre-applied to raw lanes, and horizontal axis values are
//! computed on demand from the header's scaling block.

use num_complex::Complex;

/// Horizontal (time/frequency) scaling for one waveform.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HorizontalScale {
    /// Seconds (or horizontal units) between adjacent samples.
    pub spacing: f64,
    /// Sample index of the trigger position.
    pub zero_index: f64,
    /// Sub-sample refinement of the trigger position.
    pub fractional_zero_index: f64,
    /// Unit label, e.g. `"s"`.
    pub units: String,
}

impl HorizontalScale {
    /// Axis value of the sample at `index`.
    pub fn value_at(&self, index: usize) -> f64 {
        (index as f64 - self.zero_index - self.fractional_zero_index) * self.spacing
    }

    /// Lazily computed axis values for a record of `len` samples.
    pub fn values(&self, len: usize) -> impl Iterator<Item = f64> + '_ {
        (0..len).map(move |i| self.value_at(i))
    }
}

/// Native sample storage for a scalar analog waveform.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalogSamples {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Float32(Vec<f32>),
}

impl AnalogSamples {
    /// Number of samples in the record.
    pub fn len(&self) -> usize {
        match self {
            AnalogSamples::Int8(v) => v.len(),
            AnalogSamples::Int16(v) => v.len(),
            AnalogSamples::Float32(v) => v.len(),
        }
    }

    /// True when the record holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw (un-normalized) sample value at `index`.
    pub fn raw_at(&self, index: usize) -> f64 {
        match self {
            AnalogSamples::Int8(v) => f64::from(v[index]),
            AnalogSamples::Int16(v) => f64::from(v[index]),
            AnalogSamples::Float32(v) => f64::from(v[index]),
        }
    }
}

/// A scalar analog channel record.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogWaveform {
    /// Symbol the record was read from.
    pub source_name: String,
    pub horizontal: HorizontalScale,
    /// Vertical units per raw count.
    pub y_spacing: f64,
    /// Vertical offset applied after scaling.
    pub y_offset: f64,
    /// Vertical unit label, e.g. `"V"`.
    pub y_units: String,
    pub samples: AnalogSamples,
}

impl AnalogWaveform {
    /// Number of samples in the record.
    pub fn record_length(&self) -> usize {
        self.samples.len()
    }

    /// Sample at `index` scaled into vertical units.
    pub fn normalized_at(&self, index: usize) -> f64 {
        self.samples.raw_at(index) * self.y_spacing + self.y_offset
    }

    /// Lazily computed horizontal axis values.
    pub fn x_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.horizontal.values(self.record_length())
    }
}

/// Spectrum-view metadata attached to an I/Q record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IqMeta {
    pub center_frequency: f64,
    pub fft_length: f64,
    pub resolution_bandwidth: f64,
    pub span: f64,
    pub window: String,
    /// Effective sample rate derived from the FFT window shape.
    pub sample_rate: f64,
}

impl IqMeta {
    /// Derive metadata from header fields. The window type determines the
    /// equivalent-noise-bandwidth factor relating FFT length and RBW to the
    /// sample rate; unknown windows fall back to the span.
    pub fn derive(
        center_frequency: f64,
        fft_length: f64,
        resolution_bandwidth: f64,
        span: f64,
        window: &str,
    ) -> Self {
        let sample_rate = match window {
            "Blackharris" => (fft_length * resolution_bandwidth) / 1.9,
            "Flattop2" => (fft_length * resolution_bandwidth) / 3.77,
            "Hanning" => (fft_length * resolution_bandwidth) / 1.44,
            "Hamming" => (fft_length * resolution_bandwidth) / 1.3,
            "Rectangle" => (fft_length * resolution_bandwidth) / 0.89,
            "Kaiserbessel" => (fft_length * resolution_bandwidth) / 2.23,
            _ => span,
        };
        Self {
            center_frequency,
            fft_length,
            resolution_bandwidth,
            span,
            window: window.to_string(),
            sample_rate,
        }
    }
}

/// Native sample storage for an I/Q waveform, de-interleaved into complex
/// entries. The lane width follows the header's source width.
#[derive(Debug, Clone, PartialEq)]
pub enum IqSamples {
    Int16(Vec<Complex<i16>>),
    Int32(Vec<Complex<i32>>),
    Float32(Vec<Complex<f32>>),
}

impl IqSamples {
    /// Number of complex entries in the record.
    pub fn len(&self) -> usize {
        match self {
            IqSamples::Int16(v) => v.len(),
            IqSamples::Int32(v) => v.len(),
            IqSamples::Float32(v) => v.len(),
        }
    }

    /// True when the record holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A spectrum-view channel record of interleaved I/Q pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct IqWaveform {
    /// Symbol the record was read from.
    pub source_name: String,
    pub horizontal: HorizontalScale,
    /// Vertical units per raw count, applied to both lanes.
    pub iq_spacing: f64,
    pub iq_offset: f64,
    pub iq_units: String,
    pub meta: IqMeta,
    pub samples: IqSamples,
}

impl IqWaveform {
    /// Number of complex entries in the record.
    pub fn record_length(&self) -> usize {
        self.samples.len()
    }
}

/// Native sample storage for a digital waveform. Each slot packs one bit
/// per probe line; the owning record's bitmask marks the meaningful bits.
#[derive(Debug, Clone, PartialEq)]
pub enum DigitalSamples {
    Int8(Vec<u8>),
    Int16(Vec<u16>),
}

impl DigitalSamples {
    /// Number of sample slots in the record.
    pub fn len(&self) -> usize {
        match self {
            DigitalSamples::Int8(v) => v.len(),
            DigitalSamples::Int16(v) => v.len(),
        }
    }

    /// True when the record holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: usize) -> u16 {
        match self {
            DigitalSamples::Int8(v) => u16::from(v[index]),
            DigitalSamples::Int16(v) => v[index],
        }
    }
}

/// A digital-probe channel record.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalWaveform {
    /// Symbol the record was read from.
    pub source_name: String,
    pub horizontal: HorizontalScale,
    /// Which bits of each sample slot carry probe lines.
    pub bitmask: u32,
    pub samples: DigitalSamples,
}

impl DigitalWaveform {
    /// Number of sample slots in the record.
    pub fn record_length(&self) -> usize {
        self.samples.len()
    }

    /// State of probe `line` at `sample`, or `None` when the bitmask marks
    /// the line as not connected.
    pub fn bit(&self, sample: usize, line: u32) -> Option<bool> {
        if line >= 16 || self.bitmask & (1u32 << line) == 0 {
            return None;
        }
        Some(self.samples.slot(sample) & (1u16 << line) != 0)
    }
}

/// A typed waveform record, one per symbol per acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    Analog(AnalogWaveform),
    Iq(IqWaveform),
    Digital(DigitalWaveform),
}

impl Waveform {
    /// Symbol the record was read from.
    pub fn source_name(&self) -> &str {
        match self {
            Waveform::Analog(w) => &w.source_name,
            Waveform::Iq(w) => &w.source_name,
            Waveform::Digital(w) => &w.source_name,
        }
    }

    /// Number of samples (complex entries for I/Q) in the record.
    pub fn record_length(&self) -> usize {
        match self {
            Waveform::Analog(w) => w.record_length(),
            Waveform::Iq(w) => w.record_length(),
            Waveform::Digital(w) => w.record_length(),
        }
    }

    /// The record as a scalar analog waveform, if it is one.
    pub fn as_analog(&self) -> Option<&AnalogWaveform> {
        match self {
            Waveform::Analog(w) => Some(w),
            _ => None,
        }
    }

    /// The record as an I/Q waveform, if it is one.
    pub fn as_iq(&self) -> Option<&IqWaveform> {
        match self {
            Waveform::Iq(w) => Some(w),
            _ => None,
        }
    }

    /// The record as a digital waveform, if it is one.
    pub fn as_digital(&self) -> Option<&DigitalWaveform> {
        match self {
            Waveform::Digital(w) => Some(w),
            _ => None,
        }
    }
}
