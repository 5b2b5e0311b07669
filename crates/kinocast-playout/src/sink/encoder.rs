//! Frame → PES → MPEG-TS packetization.
//!
//! The payload encoder is deliberately simple (static per-channel
//! parameters, luma subsampling toward the configured bitrate); what matters
//! downstream is the transport framing: 188-byte packets, per-PID 4-bit
//! continuity counters, adaptation-field stuffing and periodic PAT/PMT. The
//! byte-sink callback receives arbitrary-length buffers and must deliver
//! them completely or fail; packet-boundary safety on the wire is the
//! transport writer's contract.

use kinocast_buffer::Frame;

use crate::error::TransportError;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;

const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const NULL_PID: u16 = 0x1FFF;

/// Upper bound between PAT/PMT repetitions, counted in video frames; PSI is
/// also emitted on every GOP boundary.
const PSI_INTERVAL_FRAMES: u64 = 30;

/// Byte sink the encoder emits into.
pub type ByteSink<'a> = dyn FnMut(&[u8]) -> Result<(), TransportError> + 'a;

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub bitrate_kbps: u32,
    pub gop_size: u32,
}

/// A well-formed null transport packet: sync byte, PID 0x1FFF, a single
/// adaptation byte, the rest zero. Written directly on shutdown so the
/// stream length ends up ≡ 0 (mod 188).
pub fn null_packet() -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0u8; TS_PACKET_SIZE];
    packet[0] = TS_SYNC_BYTE;
    packet[1] = (NULL_PID >> 8) as u8;
    packet[2] = (NULL_PID & 0xFF) as u8;
    packet[3] = 0x10;
    packet
}

pub struct EncoderPipeline {
    config: EncoderConfig,
    frame_index: u64,
    frames_since_psi: u64,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
}

impl EncoderPipeline {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            frame_index: 0,
            frames_since_psi: PSI_INTERVAL_FRAMES,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
        }
    }

    /// Resets stream state for a fresh consumer: continuity counters restart
    /// and the next frame is preceded by PSI.
    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.frames_since_psi = PSI_INTERVAL_FRAMES;
        self.pat_cc = 0;
        self.pmt_cc = 0;
        self.video_cc = 0;
    }

    /// Encodes one frame at the given 90 kHz PTS and emits the resulting
    /// transport packets through `sink`.
    pub fn encode_frame(
        &mut self,
        frame: &Frame,
        pts_90k: i64,
        sink: &mut ByteSink<'_>,
    ) -> Result<(), TransportError> {
        let mut out = Vec::with_capacity(4 * TS_PACKET_SIZE);

        let gop = self.config.gop_size.max(1) as u64;
        if self.frame_index % gop == 0 || self.frames_since_psi >= PSI_INTERVAL_FRAMES {
            self.write_psi(&mut out);
            self.frames_since_psi = 0;
        }

        let payload = self.encode_payload(frame, pts_90k);
        let pes = pes_packet(pts_90k, &payload);
        self.packetize(VIDEO_PID, &pes, &mut out);

        self.frame_index += 1;
        self.frames_since_psi += 1;
        sink(&out)
    }

    /// Elementary payload: a tagged header plus luma subsampled toward the
    /// configured bitrate. Encoder parameters are static per channel.
    fn encode_payload(&self, frame: &Frame, pts_90k: i64) -> Vec<u8> {
        let luma_len = (frame.width * frame.height) as usize;
        let luma = &frame.data[..luma_len.min(frame.data.len())];

        let fps = self.config.target_fps.max(1.0);
        let target_bytes =
            ((self.config.bitrate_kbps as f64 * 1000.0 / 8.0 / fps) as usize).max(64);
        let step = luma.len().div_ceil(target_bytes).max(1);

        let mut payload = Vec::with_capacity(24 + luma.len() / step + 1);
        payload.extend_from_slice(b"KNCF");
        payload.extend_from_slice(&(frame.width as u16).to_be_bytes());
        payload.extend_from_slice(&(frame.height as u16).to_be_bytes());
        payload.extend_from_slice(&pts_90k.to_be_bytes());
        payload.extend_from_slice(&(step as u32).to_be_bytes());
        payload.extend(luma.iter().step_by(step));
        payload
    }

    fn write_psi(&mut self, out: &mut Vec<u8>) {
        let pat = pat_section();
        let cc = &mut self.pat_cc;
        write_section_packet(PAT_PID, cc, &pat, out);
        let pmt = pmt_section();
        let cc = &mut self.pmt_cc;
        write_section_packet(PMT_PID, cc, &pmt, out);
    }

    /// Splits a PES packet across TS packets: payload-unit-start on the
    /// first, adaptation-field stuffing on the last short one.
    fn packetize(&mut self, pid: u16, pes: &[u8], out: &mut Vec<u8>) {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let chunk = (pes.len() - offset).min(TS_PAYLOAD_SIZE);
            let mut packet = [0u8; TS_PACKET_SIZE];
            packet[0] = TS_SYNC_BYTE;
            packet[1] = (pid >> 8) as u8 | if first { 0x40 } else { 0x00 };
            packet[2] = (pid & 0xFF) as u8;

            let cc = self.video_cc;
            self.video_cc = (self.video_cc + 1) & 0x0F;

            let mut body = 4;
            if chunk < TS_PAYLOAD_SIZE {
                // Adaptation field fills the gap in front of the payload.
                packet[3] = 0x30 | cc;
                let adaptation_len = TS_PAYLOAD_SIZE - chunk - 1;
                packet[4] = adaptation_len as u8;
                if adaptation_len > 0 {
                    packet[5] = 0x00;
                    for byte in packet[6..6 + adaptation_len - 1].iter_mut() {
                        *byte = 0xFF;
                    }
                }
                body = 4 + 1 + adaptation_len;
            } else {
                packet[3] = 0x10 | cc;
            }

            packet[body..body + chunk].copy_from_slice(&pes[offset..offset + chunk]);
            out.extend_from_slice(&packet);
            offset += chunk;
            first = false;
        }
    }
}

/// PES packet with stream id 0xE0, unbounded length and a 33-bit PTS.
fn pes_packet(pts_90k: i64, payload: &[u8]) -> Vec<u8> {
    let mut pes = Vec::with_capacity(14 + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0]);
    pes.extend_from_slice(&[0x00, 0x00]);
    pes.push(0x80);
    pes.push(0x80); // PTS only
    pes.push(5);
    pes.extend_from_slice(&encode_pts(pts_90k));
    pes.extend_from_slice(payload);
    pes
}

fn encode_pts(pts_90k: i64) -> [u8; 5] {
    let pts = (pts_90k as u64) & 0x1_FFFF_FFFF;
    [
        0x20 | (((pts >> 30) as u8) << 1) | 0x01,
        (pts >> 22) as u8,
        (((pts >> 14) as u8) & 0xFE) | 0x01,
        (pts >> 7) as u8,
        (((pts << 1) as u8) & 0xFE) | 0x01,
    ]
}

fn pat_section() -> Vec<u8> {
    let mut section = vec![
        0x00, // table_id
        0xB0, 0x0D, // section_syntax + length 13
        0x00, 0x01, // transport_stream_id
        0xC1, // version 0, current
        0x00, 0x00, // section number / last
        0x00, 0x01, // program number 1
        (0xE0 | (PMT_PID >> 8) as u8),
        (PMT_PID & 0xFF) as u8,
    ];
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pmt_section() -> Vec<u8> {
    let mut section = vec![
        0x02, // table_id
        0xB0, 0x12, // section_syntax + length 18
        0x00, 0x01, // program number
        0xC1, // version 0, current
        0x00, 0x00, // section number / last
        (0xE0 | (VIDEO_PID >> 8) as u8),
        (VIDEO_PID & 0xFF) as u8, // PCR PID
        0xF0, 0x00, // program_info_length 0
        0x06, // stream_type: PES private data
        (0xE0 | (VIDEO_PID >> 8) as u8),
        (VIDEO_PID & 0xFF) as u8,
        0xF0, 0x00, // ES info length 0
    ];
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// One PSI section in a single TS packet, pointer field first, stuffed with
/// 0xFF to the packet boundary.
fn write_section_packet(pid: u16, cc: &mut u8, section: &[u8], out: &mut Vec<u8>) {
    debug_assert!(section.len() + 1 <= TS_PAYLOAD_SIZE, "section too large");
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = TS_SYNC_BYTE;
    packet[1] = 0x40 | (pid >> 8) as u8;
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10 | *cc;
    *cc = (*cc + 1) & 0x0F;
    packet[4] = 0x00; // pointer field
    packet[5..5 + section.len()].copy_from_slice(section);
    out.extend_from_slice(&packet);
}

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, init all-ones, no reflection.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame {
            pts_us: 0,
            dts_us: 0,
            duration_s: 1.0 / 30.0,
            source_uri: Arc::from("test"),
            width,
            height,
            data: vec![50u8; Frame::yuv420_len(width, height)],
        }
    }

    fn encoder() -> EncoderPipeline {
        EncoderPipeline::new(EncoderConfig {
            width: 64,
            height: 64,
            target_fps: 30.0,
            bitrate_kbps: 400,
            gop_size: 30,
        })
    }

    #[test]
    fn output_is_whole_ts_packets_with_sync_bytes() {
        let mut pipeline = encoder();
        let mut bytes = Vec::new();
        pipeline
            .encode_frame(&test_frame(64, 64), 3000, &mut |buf| {
                bytes.extend_from_slice(buf);
                Ok(())
            })
            .expect("encode failed");
        assert_eq!(bytes.len() % TS_PACKET_SIZE, 0);
        for packet in bytes.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], TS_SYNC_BYTE);
        }
    }

    #[test]
    fn continuity_counters_advance_per_pid() {
        let mut pipeline = encoder();
        let mut bytes = Vec::new();
        for index in 0..3 {
            pipeline
                .encode_frame(&test_frame(64, 64), index * 3000, &mut |buf| {
                    bytes.extend_from_slice(buf);
                    Ok(())
                })
                .expect("encode failed");
        }
        let mut last_video_cc: Option<u8> = None;
        for packet in bytes.chunks(TS_PACKET_SIZE) {
            let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
            if pid == VIDEO_PID {
                let cc = packet[3] & 0x0F;
                if let Some(previous) = last_video_cc {
                    assert_eq!(cc, (previous + 1) & 0x0F, "continuity counter skipped");
                }
                last_video_cc = Some(cc);
            }
        }
        assert!(last_video_cc.is_some());
    }

    #[test]
    fn first_frame_is_preceded_by_pat_and_pmt() {
        let mut pipeline = encoder();
        let mut bytes = Vec::new();
        pipeline
            .encode_frame(&test_frame(64, 64), 0, &mut |buf| {
                bytes.extend_from_slice(buf);
                Ok(())
            })
            .expect("encode failed");
        let pids: Vec<u16> = bytes
            .chunks(TS_PACKET_SIZE)
            .map(|p| ((p[1] as u16 & 0x1F) << 8) | p[2] as u16)
            .collect();
        assert_eq!(pids[0], PAT_PID);
        assert_eq!(pids[1], PMT_PID);
        assert!(pids[2..].iter().all(|&pid| pid == VIDEO_PID));
    }

    #[test]
    fn null_packet_is_well_formed() {
        let packet = null_packet();
        assert_eq!(packet.len(), TS_PACKET_SIZE);
        assert_eq!(packet[0], 0x47);
        assert_eq!(packet[1], 0x1F);
        assert_eq!(packet[2], 0xFF);
        assert_eq!(packet[3], 0x10);
        assert!(packet[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pts_survives_pes_encoding() {
        let pts: i64 = 0x1_2345_6789 & 0x1_FFFF_FFFF;
        let bytes = encode_pts(pts);
        let decoded: u64 = (((bytes[0] as u64 >> 1) & 0x07) << 30)
            | ((bytes[1] as u64) << 22)
            | (((bytes[2] as u64 >> 1) & 0x7F) << 15)
            | ((bytes[3] as u64) << 7)
            | ((bytes[4] as u64 >> 1) & 0x7F);
        assert_eq!(decoded, pts as u64);
    }

    #[test]
    fn sink_error_propagates() {
        let mut pipeline = encoder();
        let result = pipeline.encode_frame(&test_frame(64, 64), 0, &mut |_| {
            Err(TransportError::NotConnected)
        });
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
