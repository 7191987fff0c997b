// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use avif_inspect::obu;
use avif_inspect::{copy_plan, read_meta, Error, PropertyDetail};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bx(name: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let size: u32 = (8 + content.len()).try_into().expect("test box too large");
    let mut out = Vec::new();
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(content);
    out
}

fn full_box(name: &[u8; 4], version: u8, flags: u32, content: &[u8]) -> Vec<u8> {
    let mut inner = Vec::new();
    inner.push(version);
    inner.extend_from_slice(&flags.to_be_bytes()[1..]);
    inner.extend_from_slice(content);
    bx(name, &inner)
}

fn cat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

fn hdlr_pict() -> Vec<u8> {
    full_box(
        b"hdlr",
        0,
        0,
        &cat(&[&[0, 0, 0, 0], b"pict", &[0u8; 12], &[0]]),
    )
}

fn pitm_v0(item_id: u16) -> Vec<u8> {
    full_box(b"pitm", 0, 0, &item_id.to_be_bytes())
}

fn infe_v2(item_id: u16, item_type: &[u8; 4]) -> Vec<u8> {
    full_box(
        b"infe",
        2,
        0,
        &cat(&[&item_id.to_be_bytes(), &[0, 0], item_type, &[0]]),
    )
}

fn iinf_v0(entries: &[&[u8]]) -> Vec<u8> {
    let count: u16 = entries.len().try_into().unwrap();
    full_box(
        b"iinf",
        0,
        0,
        &cat(&[&count.to_be_bytes(), &cat(entries)]),
    )
}

/// iloc version 1 with one item: 4-byte offsets and lengths, 4-byte base.
fn iloc_v1_single(
    item_id: u16,
    construction_method: u8,
    data_reference_index: u16,
    base_offset: u32,
    extents: &[(u32, u32)],
) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(&[0x44, 0x40]); // offset, length and base widths of 4
    content.extend_from_slice(&1u16.to_be_bytes());
    content.extend_from_slice(&item_id.to_be_bytes());
    content.extend_from_slice(&u16::from(construction_method).to_be_bytes());
    content.extend_from_slice(&data_reference_index.to_be_bytes());
    content.extend_from_slice(&base_offset.to_be_bytes());
    let extent_count: u16 = extents.len().try_into().unwrap();
    content.extend_from_slice(&extent_count.to_be_bytes());
    for (offset, length) in extents {
        content.extend_from_slice(&offset.to_be_bytes());
        content.extend_from_slice(&length.to_be_bytes());
    }
    full_box(b"iloc", 1, 0, &content)
}

/// A bit accumulator for building Sequence Header payloads, MSB first.
struct BitWriter {
    bytes: Vec<u8>,
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            used: 0,
        }
    }

    fn put(&mut self, count: u8, value: u32) {
        for i in (0..count).rev() {
            let bit = ((value >> i) & 1) as u8;
            if self.used == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.last_mut().unwrap();
            *last |= bit << (7 - self.used);
            self.used = (self.used + 1) % 8;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[test]
fn plan_from_file_offsets() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &hdlr_pict(),
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 0, 0, 1000, &[(0, 512)]),
        ]),
    );
    let mut file = meta;
    file.resize(1512, 0x5a);

    let summary = read_meta(&file).expect("read_meta failed");
    assert_eq!(summary.handler_type.unwrap(), b"pict");
    assert_eq!(summary.primary_item_id, Some(1));
    assert_eq!(summary.primary_item().unwrap().item_type.unwrap(), b"av01");

    let plan = summary.plan_extraction(file.len() as u64).expect("plan failed");
    let ranges = plan.ranges.as_slice();
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].src_offset, ranges[0].len), (1000, 512));

    let mut out = Vec::new();
    assert_eq!(copy_plan(&file, &plan, &mut out).unwrap(), 512);
    assert_eq!(out, &file[1000..1512]);
}

#[test]
fn plan_from_idat() {
    init_log();
    let pitm = pitm_v0(1);
    let iinf = iinf_v0(&[&infe_v2(1, b"av01")]);
    let iloc = iloc_v1_single(1, 1, 0, 0, &[(64, 100)]);

    // pad with a free box so the idat payload lands at file offset 256
    let prefix = 12 + pitm.len() + iinf.len() + iloc.len();
    let free = bx(b"free", &vec![0u8; 256 - 8 - prefix - 8]);
    let idat_payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    let idat = bx(b"idat", &idat_payload);

    let file = full_box(
        b"meta",
        0,
        0,
        &cat(&[&pitm, &iinf, &iloc, &free, &idat]),
    );

    let summary = read_meta(&file).expect("read_meta failed");
    let idat_box = summary.idat.expect("idat should be recorded");
    assert_eq!((idat_box.offset, idat_box.size), (256, 1024));

    let plan = summary.plan_extraction(file.len() as u64).expect("plan failed");
    let ranges = plan.ranges.as_slice();
    assert_eq!(ranges.len(), 1);
    assert_eq!((ranges[0].src_offset, ranges[0].len), (320, 100));

    let mut out = Vec::new();
    copy_plan(&file, &plan, &mut out).unwrap();
    assert_eq!(out, &idat_payload[64..164]);
}

#[test]
fn plan_concatenates_split_extents() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 0, 0, 0, &[(600, 40), (700, 24)]),
        ]),
    );
    let mut file = meta;
    file.resize(1024, 0);
    for (i, byte) in file.iter_mut().enumerate().skip(600) {
        *byte = (i % 256) as u8;
    }

    let summary = read_meta(&file).unwrap();
    let plan = summary.plan_extraction(file.len() as u64).unwrap();
    let mut out = Vec::new();
    assert_eq!(copy_plan(&file, &plan, &mut out).unwrap(), 64);
    assert_eq!(out, cat(&[&file[600..640], &file[700..724]]));
}

#[test]
fn property_summary() {
    init_log();
    let ispe = full_box(
        b"ispe",
        0,
        0,
        &cat(&[&1024u32.to_be_bytes(), &768u32.to_be_bytes()]),
    );
    let pixi = full_box(b"pixi", 0, 0, &[3, 8, 8, 8]);
    let av1c = bx(b"av1C", &[0x81, 0x08, 0x0c, 0x00]);
    let ipco = bx(b"ipco", &cat(&[&ispe, &pixi, &av1c]));
    let ipma = full_box(b"ipma", 0, 0, &[0, 0, 0, 1, 0, 1, 3, 0x01, 0x82, 0x83]);
    let iprp = bx(b"iprp", &cat(&[&ipco, &ipma]));
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[&iinf_v0(&[&infe_v2(1, b"av01")]), &iprp]),
    );

    let summary = read_meta(&meta).unwrap();
    assert_eq!(summary.properties.len(), 3);

    match summary.property(1).map(|p| &p.detail) {
        Some(PropertyDetail::ImageSpatialExtents { width, height }) => {
            assert_eq!((*width, *height), (1024, 768));
        }
        other => panic!("expected ispe, got {other:?}"),
    }
    match summary.property(2).map(|p| &p.detail) {
        Some(PropertyDetail::PixelInformation {
            num_channels,
            depths,
            truncated,
        }) => {
            assert_eq!(*num_channels, 3);
            assert_eq!(depths.as_slice(), &[8, 8, 8]);
            assert!(!truncated);
        }
        other => panic!("expected pixi, got {other:?}"),
    }
    match summary.property(3).map(|p| &p.detail) {
        Some(PropertyDetail::Av1Config(config)) => {
            assert_eq!(config.profile, 0);
            assert_eq!(config.level, 8);
            assert_eq!(config.tier, 0);
            assert!(!config.monochrome);
            assert_eq!(config.chroma_subsampling_x, 1);
            assert_eq!(config.chroma_subsampling_y, 1);
        }
        other => panic!("expected av1C, got {other:?}"),
    }

    let associated: Vec<_> = summary.item_properties(1).collect();
    assert_eq!(associated.len(), 3);
    let essentials: Vec<bool> = associated.iter().map(|(a, _)| a.essential).collect();
    assert_eq!(essentials, [false, true, true]);
    for (i, (association, property)) in associated.iter().enumerate() {
        assert_eq!(usize::from(association.property_index), i + 1);
        assert!(property.is_some());
    }
}

#[test]
fn association_outside_property_table() {
    init_log();
    let ipma = full_box(b"ipma", 0, 0, &[0, 0, 0, 1, 0, 1, 1, 0x09]);
    let iprp = bx(b"iprp", &ipma);
    let meta = full_box(b"meta", 0, 0, &iprp);

    let summary = read_meta(&meta).unwrap();
    let associated: Vec<_> = summary.item_properties(1).collect();
    assert_eq!(associated.len(), 1);
    assert_eq!(associated[0].0.property_index, 9);
    assert!(associated[0].1.is_none());
}

#[test]
fn sequence_header_srgb_identity() {
    init_log();
    // temporal delimiter, then a reduced still-picture sequence header
    // signalling BT.709 / sRGB / identity
    let stream = [0x12, 0x00, 0x0a, 0x05, 0x18, 0x08, 0x08, 0x68, 0x04];

    let index = obu::scan_obus(&stream).expect("scan failed");
    assert_eq!(index.obu_count, 2);
    assert_eq!(index.per_type[2], 1);
    assert_eq!(index.per_type[1], 1);
    assert_eq!(index.warnings, 0);

    let payload = index.sequence_header_payload(&stream).unwrap();
    let summary = obu::parse_sequence_header(payload).expect("parse failed");
    assert_eq!(summary.seq_profile, 0);
    assert!(summary.still_picture);
    assert!(summary.reduced_still_picture_header);
    assert_eq!(summary.operating_point_idc, 0);
    assert_eq!(summary.color.bit_depth, 8);
    assert!(!summary.color.monochrome);
    assert_eq!(
        (summary.color.subsampling_x, summary.color.subsampling_y),
        (0, 0)
    );
    assert_eq!(summary.color.color_primaries, 1);
    assert_eq!(summary.color.transfer_characteristics, 13);
    assert_eq!(summary.color.matrix_coefficients, 0);
    assert!(summary.color.full_range);
}

#[test]
fn sequence_header_full_form() {
    init_log();
    let mut w = BitWriter::new();
    w.put(3, 0); // seq_profile
    w.put(1, 0); // still_picture
    w.put(1, 0); // reduced_still_picture_header
    w.put(1, 1); // timing_info_present_flag
    w.put(32, 100); // num_units_in_display_tick
    w.put(32, 1000); // time_scale
    w.put(1, 1); // equal_picture_interval
    w.put(1, 1); // num_ticks_per_picture_minus_1, uvlc(0)
    w.put(1, 1); // decoder_model_info_present_flag
    w.put(5, 5); // buffer_delay_length_minus_1
    w.put(32, 0); // num_units_in_decoding_tick
    w.put(5, 0); // buffer_removal_time_length_minus_1
    w.put(5, 0); // frame_presentation_time_length_minus_1
    w.put(1, 1); // initial_display_delay_present_flag
    w.put(5, 1); // operating_points_cnt_minus_1
    // operating point 0
    w.put(12, 0x123); // operating_point_idc
    w.put(5, 9); // seq_level_idx > 7
    w.put(1, 1); // seq_tier
    w.put(1, 1); // decoder_model_present_for_this_op
    w.put(6, 33); // decoder_buffer_delay
    w.put(6, 2); // encoder_buffer_delay
    w.put(1, 0); // low_delay_mode_flag
    w.put(1, 1); // initial_display_delay_present_for_this_op
    w.put(4, 7); // initial_display_delay_minus_1
    // operating point 1
    w.put(12, 0);
    w.put(5, 3);
    w.put(1, 0); // decoder_model_present_for_this_op
    w.put(1, 0); // initial_display_delay_present_for_this_op
    w.put(4, 11); // frame_width_bits_minus_1
    w.put(4, 10); // frame_height_bits_minus_1
    w.put(12, 1919); // max_frame_width_minus_1
    w.put(11, 1079); // max_frame_height_minus_1
    w.put(1, 1); // frame_id_numbers_present_flag
    w.put(4, 5); // delta_frame_id_length_minus_2
    w.put(3, 2); // additional_frame_id_length_minus_1
    w.put(3, 0b101); // superblock and intra filter flags
    w.put(4, 0b0110); // compound and motion flags
    w.put(1, 1); // enable_order_hint
    w.put(2, 0b10); // enable_jnt_comp, enable_ref_frame_mvs
    w.put(1, 0); // seq_choose_screen_content_tools
    w.put(1, 1); // seq_force_screen_content_tools
    w.put(1, 0); // seq_choose_integer_mv
    w.put(1, 1); // seq_force_integer_mv
    w.put(3, 6); // order_hint_bits_minus_1
    w.put(3, 0b010); // enable_superres, enable_cdef, enable_restoration
    // color_config
    w.put(1, 1); // high_bitdepth
    w.put(1, 0); // mono_chrome
    w.put(1, 0); // color_description_present_flag
    w.put(1, 1); // color_range
    w.put(2, 1); // chroma_sample_position
    w.put(1, 0); // separate_uv_delta_q

    let summary = obu::parse_sequence_header(&w.finish()).expect("parse failed");
    assert_eq!(summary.seq_profile, 0);
    assert!(!summary.still_picture);
    assert!(!summary.reduced_still_picture_header);
    assert_eq!(summary.operating_point_idc, 0x123);
    assert_eq!(summary.color.bit_depth, 10);
    assert!(!summary.color.monochrome);
    assert_eq!(
        (summary.color.subsampling_x, summary.color.subsampling_y),
        (1, 1)
    );
    assert_eq!(summary.color.color_primaries, 2);
    assert_eq!(summary.color.transfer_characteristics, 2);
    assert_eq!(summary.color.matrix_coefficients, 2);
    assert!(summary.color.full_range);
}

#[test]
fn sequence_header_profile_two_subsampling() {
    init_log();
    let mut w = BitWriter::new();
    w.put(3, 2); // seq_profile
    w.put(1, 1); // still_picture
    w.put(1, 1); // reduced_still_picture_header
    w.put(5, 0); // seq_level_idx
    w.put(1, 1); // high_bitdepth
    w.put(1, 1); // twelve_bit
    w.put(1, 0); // mono_chrome
    w.put(1, 0); // color_description_present_flag
    w.put(1, 0); // color_range
    w.put(1, 1); // subsampling_x
    w.put(1, 0); // subsampling_y
    w.put(1, 0); // separate_uv_delta_q

    let summary = obu::parse_sequence_header(&w.finish()).unwrap();
    assert_eq!(summary.color.bit_depth, 12);
    assert_eq!(
        (summary.color.subsampling_x, summary.color.subsampling_y),
        (1, 0)
    );
    assert!(!summary.color.full_range);
}

#[test]
fn obu_forbidden_bit_position() {
    init_log();
    let err = obu::scan_obus(&[0x12, 0x00, 0x80, 0x01]).unwrap_err();
    assert!(matches!(err, Error::ForbiddenBit { offset: 2 }));
}

#[test]
fn pitm_unknown_version_aborts_meta() {
    init_log();
    let pitm = full_box(b"pitm", 2, 0, &[0, 0, 0, 1]);
    let meta = full_box(b"meta", 0, 0, &cat(&[&pitm, &hdlr_pict()]));
    let err = read_meta(&meta).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedVersion {
            box_type: "pitm",
            version: 2,
        }
    ));
}

#[test]
fn iinf_zero_entries() {
    init_log();
    let meta = full_box(b"meta", 0, 0, &iinf_v0(&[]));
    let summary = read_meta(&meta).unwrap();
    assert_eq!(summary.items.len(), 0);
}

#[test]
fn zero_length_extent_is_refused() {
    init_log();
    // length_size of 0 makes every extent length zero
    let mut content = Vec::new();
    content.extend_from_slice(&[0x40, 0x00]); // offset_size 4, length_size 0
    content.extend_from_slice(&1u16.to_be_bytes()); // item_count
    content.extend_from_slice(&1u16.to_be_bytes()); // item_id
    content.extend_from_slice(&[0, 0]); // construction_method 0
    content.extend_from_slice(&[0, 0]); // data_reference_index
    content.extend_from_slice(&1u16.to_be_bytes()); // extent_count
    content.extend_from_slice(&100u32.to_be_bytes()); // extent_offset
    let iloc = full_box(b"iloc", 1, 0, &content);
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[&pitm_v0(1), &iinf_v0(&[&infe_v2(1, b"av01")]), &iloc]),
    );

    let summary = read_meta(&meta).unwrap();
    let err = summary.plan_extraction(4096).unwrap_err();
    assert!(matches!(err, Error::ZeroExtentLength));
}

#[test]
fn construction_method_two_is_refused() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 2, 0, 0, &[(0, 64)]),
        ]),
    );
    let summary = read_meta(&meta).unwrap();
    assert!(matches!(
        summary.plan_extraction(4096),
        Err(Error::UnsupportedConstruction(2))
    ));
}

#[test]
fn external_data_reference_is_refused() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 0, 1, 0, &[(0, 64)]),
        ]),
    );
    let summary = read_meta(&meta).unwrap();
    assert!(matches!(
        summary.plan_extraction(4096),
        Err(Error::ExternalData)
    ));
}

#[test]
fn missing_pitm_is_refused() {
    init_log();
    let meta = full_box(b"meta", 0, 0, &iinf_v0(&[&infe_v2(1, b"av01")]));
    let summary = read_meta(&meta).unwrap();
    assert!(matches!(
        summary.plan_extraction(4096),
        Err(Error::MissingPrimary)
    ));
    assert!(summary.extraction_refusal(4096).is_some());
}

#[test]
fn non_av01_primary_is_refused() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"grid")]),
            &iloc_v1_single(1, 0, 0, 0, &[(0, 64)]),
        ]),
    );
    let summary = read_meta(&meta).unwrap();
    assert!(matches!(
        summary.plan_extraction(4096),
        Err(Error::NotCodedStill)
    ));
}

#[test]
fn extent_outside_file_is_refused() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 0, 0, 4000, &[(0, 512)]),
        ]),
    );
    let summary = read_meta(&meta).unwrap();
    assert!(matches!(
        summary.plan_extraction(1024),
        Err(Error::InvalidData(_))
    ));
}

#[test]
fn repeated_parses_are_identical() {
    init_log();
    let meta = full_box(
        b"meta",
        0,
        0,
        &cat(&[
            &hdlr_pict(),
            &pitm_v0(1),
            &iinf_v0(&[&infe_v2(1, b"av01")]),
            &iloc_v1_single(1, 0, 0, 0, &[(0, 64)]),
        ]),
    );
    assert_eq!(read_meta(&meta).unwrap(), read_meta(&meta).unwrap());

    let stream = [0x12, 0x00, 0x0a, 0x05, 0x18, 0x08, 0x08, 0x68, 0x04];
    assert_eq!(
        obu::scan_obus(&stream).unwrap(),
        obu::scan_obus(&stream).unwrap()
    );
    let payload = obu::scan_obus(&stream)
        .unwrap()
        .sequence_header_payload(&stream)
        .unwrap()
        .to_vec();
    assert_eq!(
        obu::parse_sequence_header(&payload).unwrap(),
        obu::parse_sequence_header(&payload).unwrap()
    );
}
