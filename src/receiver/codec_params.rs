use crate::wire::trtp_packet::CodecType;
use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};

/// Everything a decoder needs to know about an audio stream before it can decode access units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub codec: CodecType,
    pub sample_rate: u32,
    pub channels: u32,
    /// codec specific configuration that is passed to the decoder verbatim: the
    ///  AudioSpecificConfig for AAC, the identification header for Ogg Vorbis
    pub side_data: Option<Bytes>,
}

/// The part of an audio packet that codec parameters are derived from. Parameters are only
///  re-derived when this changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParamsInput {
    codec: CodecType,
    key: Bytes,
}

/// MPEG audio frame header bits that determine the stream parameters: sync word, version,
///  layer, sampling rate and channel mode. Bit rate, padding etc. change from frame to frame.
const MPEG_HEADER_PARAMS_MASK: u32 = 0xfffe_0cc0;

impl CodecParamsInput {
    pub fn of(codec: CodecType, aux_data: Option<&Bytes>, access_unit: &[u8]) -> CodecParamsInput {
        let key = match codec {
            CodecType::Mpeg1Audio => {
                let mut header = [0u8; 4];
                let len = access_unit.len().min(4);
                header[..len].copy_from_slice(&access_unit[..len]);
                let masked = u32::from_be_bytes(header) & MPEG_HEADER_PARAMS_MASK;
                Bytes::copy_from_slice(&masked.to_be_bytes())
            }
            _ => aux_data.cloned().unwrap_or_default(),
        };
        CodecParamsInput { codec, key }
    }
}

impl CodecParams {
    pub fn derive(codec: CodecType, aux_data: Option<&Bytes>, access_unit: &[u8]) -> anyhow::Result<CodecParams> {
        match codec {
            CodecType::PcmBigEndian | CodecType::PcmLittleEndian => Self::derive_pcm(codec, require_aux(codec, aux_data)?),
            CodecType::Mpeg1Audio => Self::derive_mpeg_audio(access_unit),
            CodecType::Aac => Self::derive_aac(require_aux(codec, aux_data)?),
            CodecType::OggVorbis => Self::derive_vorbis(require_aux(codec, aux_data)?),
        }
    }

    /// aux data: sample rate (u32), channel count (u32)
    fn derive_pcm(codec: CodecType, aux_data: &Bytes) -> anyhow::Result<CodecParams> {
        if aux_data.len() != 8 {
            bail!("PCM aux data must be 8 bytes, was {}", aux_data.len());
        }
        let mut buf = aux_data.as_ref();
        let sample_rate = buf.try_get_u32()?;
        let channels = buf.try_get_u32()?;

        if sample_rate == 0 {
            bail!("PCM sample rate must be positive");
        }
        if channels == 0 || channels > 8 {
            bail!("unsupported PCM channel count {}", channels);
        }

        Ok(CodecParams {
            codec,
            sample_rate,
            channels,
            side_data: None,
        })
    }

    fn derive_mpeg_audio(access_unit: &[u8]) -> anyhow::Result<CodecParams> {
        if access_unit.len() < 4 {
            bail!("MPEG audio access unit too short for a frame header: {} bytes", access_unit.len());
        }
        let header = u32::from_be_bytes([access_unit[0], access_unit[1], access_unit[2], access_unit[3]]);

        if header >> 21 != 0x7ff {
            bail!("MPEG audio frame header without sync word: {:#010x}", header);
        }

        let rate_divisor = match (header >> 19) & 0b11 {
            0b11 => 1, // MPEG-1
            0b10 => 2, // MPEG-2
            0b00 => 4, // MPEG-2.5
            _ => bail!("reserved MPEG audio version in frame header {:#010x}", header),
        };
        if (header >> 17) & 0b11 == 0 {
            bail!("reserved MPEG audio layer in frame header {:#010x}", header);
        }

        let base_rate = match (header >> 10) & 0b11 {
            0 => 44100,
            1 => 48000,
            2 => 32000,
            _ => bail!("reserved MPEG audio sampling rate in frame header {:#010x}", header),
        };
        let channels = if (header >> 6) & 0b11 == 0b11 { 1 } else { 2 };

        Ok(CodecParams {
            codec: CodecType::Mpeg1Audio,
            sample_rate: base_rate / rate_divisor,
            channels,
            side_data: None,
        })
    }

    /// aux data is the AudioSpecificConfig (ISO 14496-3)
    fn derive_aac(aux_data: &Bytes) -> anyhow::Result<CodecParams> {
        const SAMPLE_RATES: [u32; 13] = [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350];

        let mut bits = BitReader::new(aux_data);

        let object_type = bits.read(5)?;
        if object_type == 31 {
            bits.read(6)?;
        }

        let rate_idx = bits.read(4)?;
        let sample_rate = if rate_idx == 0xf {
            bits.read(24)?
        }
        else {
            *SAMPLE_RATES.get(rate_idx as usize)
                .ok_or_else(|| anyhow!("reserved AAC sampling frequency index {}", rate_idx))?
        };

        let channels = match bits.read(4)? {
            0 => bail!("AAC channel configuration in a program config element is not supported"),
            c @ 1..=6 => c,
            7 => 8,
            other => bail!("reserved AAC channel configuration {}", other),
        };

        Ok(CodecParams {
            codec: CodecType::Aac,
            sample_rate,
            channels,
            side_data: Some(aux_data.clone()),
        })
    }

    /// aux data starts with the Vorbis identification header
    fn derive_vorbis(aux_data: &Bytes) -> anyhow::Result<CodecParams> {
        const IDENTIFICATION_HEADER_LEN: usize = 30;

        if aux_data.len() < IDENTIFICATION_HEADER_LEN {
            bail!("Vorbis identification header too short: {} bytes", aux_data.len());
        }
        if &aux_data[..7] != b"\x01vorbis" {
            bail!("aux data is not a Vorbis identification header");
        }

        let mut buf = &aux_data[7..];
        let version = buf.try_get_u32_le()?;
        if version != 0 {
            bail!("unsupported Vorbis version {}", version);
        }
        let channels = buf.try_get_u8()? as u32;
        let sample_rate = buf.try_get_u32_le()?;
        if channels == 0 || sample_rate == 0 {
            bail!("invalid Vorbis stream: {} channels, sample rate {}", channels, sample_rate);
        }
        if aux_data[IDENTIFICATION_HEADER_LEN - 1] & 1 == 0 {
            bail!("Vorbis identification header without framing bit");
        }

        Ok(CodecParams {
            codec: CodecType::OggVorbis,
            sample_rate,
            channels,
            side_data: Some(aux_data.clone()),
        })
    }
}

fn require_aux(codec: CodecType, aux_data: Option<&Bytes>) -> anyhow::Result<&Bytes> {
    aux_data.ok_or_else(|| anyhow!("{:?} requires aux data", codec))
}

/// MSB first
struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, bit_pos: 0 }
    }

    fn read(&mut self, num_bits: usize) -> anyhow::Result<u32> {
        if self.bit_pos + num_bits > self.data.len() * 8 {
            bail!("bit stream truncated");
        }

        let mut result = 0u32;
        for _ in 0..num_bits {
            let byte = self.data[self.bit_pos / 8];
            let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
            result = (result << 1) | bit as u32;
            self.bit_pos += 1;
        }
        Ok(result)
    }
}
