//! Size-delimited AV1 OBU stream scanning and Sequence Header decoding.

use crate::{Error, Result};

use bitreader::BitReader;

const OBU_SEQUENCE_HEADER: u8 = 1;

/// Value that indicates the allow_screen_content_tools syntax element is coded
const SELECT_SCREEN_CONTENT_TOOLS: u8 = 2;

/// Where an OBU's payload sits inside the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObuLocation {
    pub offset: usize,
    pub size: usize,
}

/// Tally of a size-delimited OBU stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ObuIndex {
    pub obu_count: u32,
    /// Count per obu_type, 0..=15.
    pub per_type: [u32; 16],
    /// Payload location of the first Sequence Header OBU.
    pub sequence_header: Option<ObuLocation>,
    /// Count of tolerated anomalies (also reported through `log`).
    pub warnings: u32,
}

impl ObuIndex {
    /// Borrow the payload of the first Sequence Header OBU from the buffer
    /// the index was scanned from.
    pub fn sequence_header_payload<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let loc = self
            .sequence_header
            .ok_or(Error::Unsupported("no sequence header obu in stream"))?;
        loc.offset
            .checked_add(loc.size)
            .and_then(|end| data.get(loc.offset..end))
            .ok_or(Error::InvalidData("sequence header location outside the buffer"))
    }
}

/// Walk a size-delimited OBU stream from byte 0 and index it by type.
///
/// Every OBU must carry `obu_has_size_field`; a run of zero bytes reaching
/// the end of the buffer is accepted as trailing padding. The scan succeeds
/// whether zero or several Sequence Headers are present; callers reject the
/// cases they cannot use.
pub fn scan_obus(data: &[u8]) -> Result<ObuIndex> {
    let mut index = ObuIndex::default();
    let mut pos = 0;

    while pos < data.len() {
        if data[pos..].iter().all(|&b| b == 0) {
            debug!("{} bytes of zero padding after the last obu", data.len() - pos);
            break;
        }

        let offset = pos;
        let byte = data[pos];
        pos += 1;

        if byte & 0x80 != 0 {
            return Err(Error::ForbiddenBit { offset });
        }
        let obu_type = (byte >> 3) & 0x0f;
        let obu_extension_flag = byte & 0x04 != 0;
        let obu_has_size_field = byte & 0x02 != 0;
        if !obu_has_size_field {
            return Err(Error::NoSizeField { offset });
        }

        if obu_extension_flag {
            // temporal_id, spatial_id and reserved bits
            if pos >= data.len() {
                return Err(Error::EndOfStream);
            }
            pos += 1;
        }

        let mut size_field = &data[pos..];
        let obu_size = leb128::read::unsigned(&mut size_field)
            .map_err(|_| Error::InvalidData("malformed leb128 obu_size"))?;
        pos = data.len() - size_field.len();

        let obu_size: usize = obu_size
            .try_into()
            .map_err(|_| Error::PayloadOverrun { offset })?;
        let payload_end = pos
            .checked_add(obu_size)
            .filter(|&end| end <= data.len())
            .ok_or(Error::PayloadOverrun { offset })?;

        index.obu_count += 1;
        index.per_type[usize::from(obu_type)] += 1;
        if obu_type == OBU_SEQUENCE_HEADER {
            if index.sequence_header.is_none() {
                index.sequence_header = Some(ObuLocation {
                    offset: pos,
                    size: obu_size,
                });
            } else {
                warn!("additional sequence header obu at offset {offset}, ignored");
                index.warnings += 1;
            }
        }

        pos = payload_end;
    }

    Ok(index)
}

/// AV1 uvlc(): a unary count of leading zeros selects how many literal bits
/// follow.
pub fn read_uvlc(b: &mut BitReader<'_>) -> Result<u32> {
    let mut leading_zeros = 0u8;
    while !b.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(Error::UvlcTooLong);
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let suffix = b.read_u32(leading_zeros)?;
    Ok((1u32 << leading_zeros) - 1 + suffix)
}

/// Everything a still-image reader needs from a Sequence Header OBU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceHeaderSummary {
    pub seq_profile: u8,
    pub still_picture: bool,
    pub reduced_still_picture_header: bool,
    /// operating_point_idc of operating point 0 (0 in the reduced form).
    pub operating_point_idc: u16,
    pub color: ColorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorConfig {
    /// 8, 10 or 12.
    pub bit_depth: u8,
    pub monochrome: bool,
    pub subsampling_x: u8,
    pub subsampling_y: u8,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub full_range: bool,
}

/// Bit-exact parse of a Sequence Header OBU payload.
///
/// Fields the summary does not carry are still consumed positionally;
/// anything after color_config (and any trailing bits) is ignored.
pub fn parse_sequence_header(data: &[u8]) -> Result<SequenceHeaderSummary> {
    let mut b = BitReader::new(data);

    let seq_profile = b.read_u8(3)?;
    let still_picture = b.read_bool()?;
    let reduced_still_picture_header = b.read_bool()?;

    let mut operating_point_idc = 0;

    if reduced_still_picture_header {
        let _seq_level_idx = b.read_u8(5)?;
    } else {
        let mut decoder_model_info_present_flag = false;
        let mut buffer_delay_length = 0u8;

        let timing_info_present_flag = b.read_bool()?;
        if timing_info_present_flag {
            // num_units_in_display_tick, time_scale
            b.skip(64)?;
            let equal_picture_interval = b.read_bool()?;
            if equal_picture_interval {
                // num_ticks_per_picture_minus_1
                read_uvlc(&mut b)?;
            }
            decoder_model_info_present_flag = b.read_bool()?;
            if decoder_model_info_present_flag {
                buffer_delay_length = 1 + b.read_u8(5)?;
                // num_units_in_decoding_tick
                b.skip(32)?;
                // buffer_removal_time_length_minus_1,
                // frame_presentation_time_length_minus_1
                b.skip(10)?;
            }
        }

        let initial_display_delay_present_flag = b.read_bool()?;
        let operating_points_cnt = 1 + b.read_u8(5)?;
        for i in 0..operating_points_cnt {
            let idc = b.read_u16(12)?;
            if i == 0 {
                operating_point_idc = idc;
            }
            let seq_level_idx = b.read_u8(5)?;
            if seq_level_idx > 7 {
                let _seq_tier = b.read_bool()?;
            }
            if decoder_model_info_present_flag {
                let decoder_model_present_for_this_op = b.read_bool()?;
                if decoder_model_present_for_this_op {
                    let _decoder_buffer_delay = b.read_u32(buffer_delay_length)?;
                    let _encoder_buffer_delay = b.read_u32(buffer_delay_length)?;
                    let _low_delay_mode_flag = b.read_bool()?;
                }
            }
            if initial_display_delay_present_flag {
                let initial_display_delay_present_for_this_op = b.read_bool()?;
                if initial_display_delay_present_for_this_op {
                    let _initial_display_delay = 1 + b.read_u8(4)?;
                }
            }
        }

        let frame_width_bits = 1 + b.read_u8(4)?;
        let frame_height_bits = 1 + b.read_u8(4)?;
        // max_frame_width_minus_1, max_frame_height_minus_1
        b.skip(u64::from(frame_width_bits) + u64::from(frame_height_bits))?;

        let frame_id_numbers_present_flag = b.read_bool()?;
        if frame_id_numbers_present_flag {
            // delta_frame_id_length_minus_2, additional_frame_id_length_minus_1
            b.skip(7)?;
        }

        // use_128x128_superblock, enable_filter_intra, enable_intra_edge_filter
        b.skip(3)?;
        // enable_interintra_compound, enable_masked_compound,
        // enable_warped_motion, enable_dual_filter
        b.skip(4)?;

        let enable_order_hint = b.read_bool()?;
        if enable_order_hint {
            // enable_jnt_comp, enable_ref_frame_mvs
            b.skip(2)?;
        }

        let seq_choose_screen_content_tools = b.read_bool()?;
        let seq_force_screen_content_tools = if seq_choose_screen_content_tools {
            SELECT_SCREEN_CONTENT_TOOLS
        } else {
            b.read_u8(1)?
        };
        if seq_force_screen_content_tools > 0 {
            let seq_choose_integer_mv = b.read_bool()?;
            if !seq_choose_integer_mv {
                let _seq_force_integer_mv = b.read_u8(1)?;
            }
        }

        if enable_order_hint {
            // order_hint_bits_minus_1
            b.skip(3)?;
        }

        // enable_superres, enable_cdef, enable_restoration
        b.skip(3)?;
    }

    let color = color_config(&mut b, seq_profile)?;

    Ok(SequenceHeaderSummary {
        seq_profile,
        still_picture,
        reduced_still_picture_header,
        operating_point_idc,
        color,
    })
}

fn color_config(b: &mut BitReader<'_>, seq_profile: u8) -> Result<ColorConfig> {
    let high_bitdepth = b.read_bool()?;
    let bit_depth = if seq_profile == 2 && high_bitdepth {
        let twelve_bit = b.read_bool()?;
        if twelve_bit {
            12
        } else {
            10
        }
    } else if high_bitdepth {
        10
    } else {
        8
    };

    let monochrome = if seq_profile == 1 {
        false
    } else {
        b.read_bool()?
    };

    let color_description_present_flag = b.read_bool()?;
    let mut color_primaries = 2;
    let mut transfer_characteristics = 2;
    let mut matrix_coefficients = 2;
    if color_description_present_flag {
        color_primaries = b.read_u8(8)?;
        transfer_characteristics = b.read_u8(8)?;
        matrix_coefficients = b.read_u8(8)?;
    }

    let full_range = b.read_bool()?;

    let subsampling_x;
    let subsampling_y;
    if monochrome {
        subsampling_x = 1;
        subsampling_y = 1;
    } else if color_primaries == 1 // Bt709
        && transfer_characteristics == 13 // Srgb
        && matrix_coefficients == 0
    {
        subsampling_x = 0;
        subsampling_y = 0;
        let _separate_uv_delta_q = b.read_bool()?;
    } else {
        if seq_profile == 0 {
            subsampling_x = 1;
            subsampling_y = 1;
        } else if seq_profile == 1 {
            subsampling_x = 0;
            subsampling_y = 0;
        } else if bit_depth == 12 {
            subsampling_x = b.read_u8(1)?;
            subsampling_y = if subsampling_x != 0 {
                b.read_u8(1)?
            } else {
                0
            };
        } else {
            subsampling_x = 1;
            subsampling_y = 0;
        }
        if subsampling_x != 0 && subsampling_y != 0 {
            let _chroma_sample_position = b.read_u8(2)?;
        }
        let _separate_uv_delta_q = b.read_bool()?;
    }

    Ok(ColorConfig {
        bit_depth,
        monochrome,
        subsampling_x,
        subsampling_y,
        color_primaries,
        transfer_characteristics,
        matrix_coefficients,
        full_range,
    })
}
