//! H.264 codec-configuration handling.
//!
//! Live encoders deliver SPS and PPS as Annex-B NAL units separated by
//! 4-byte start codes. MP4 stores them inside an `avcC` decoder
//! configuration record instead, and stores each media NAL unit with a
//! 4-byte big-endian length prefix in place of its start code.

use crate::error::{MuxError, MuxResult};

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Width of the NAL length field written before every H.264 sample.
pub const NAL_LENGTH_SIZE: u32 = 4;

/// Build the AVC decoder configuration record from an Annex-B blob holding
/// one SPS followed by one PPS.
///
/// The profile, compatibility, and level bytes are fixed at Baseline level
/// 3.0. TODO: parse profile_idc and level_idc out of the SPS instead.
pub fn make_avc_config(data: &[u8]) -> MuxResult<Vec<u8>> {
    if data.len() < 4 || data[..4] != START_CODE {
        return Err(MuxError::MalformedStream(
            "AVC codec config must begin with a start code".into(),
        ));
    }

    // The second start code separates the SPS from the PPS.
    let mut pps_offset = 4;
    while pps_offset + 3 < data.len() && data[pps_offset..pps_offset + 4] != START_CODE {
        pps_offset += 1;
    }
    if pps_offset + 3 >= data.len() {
        return Err(MuxError::MalformedStream(
            "no start code found for the picture parameter set".into(),
        ));
    }

    let sps = &data[4..pps_offset];
    let pps = &data[pps_offset + 4..];

    let mut record = Vec::with_capacity(12 + sps.len() + pps.len());
    record.push(1); // configurationVersion
    record.push(0x42); // AVCProfileIndication: Baseline
    record.push(0x80); // profile_compatibility
    record.push(0x1E); // AVCLevelIndication: 3.0
    record.push(0xFC | 3); // lengthSizeMinusOne = 3 (4-byte NAL lengths)
    record.push(0xE0 | 1); // one sequence parameter set
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1); // one picture parameter set
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    Ok(record)
}

/// Drop a leading Annex-B start code, if present.
pub fn strip_start_code(payload: &[u8]) -> &[u8] {
    if payload.len() >= 4 && payload[..4] == START_CODE {
        &payload[4..]
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x02, 0x80, 0xF6];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

    fn annex_b_config() -> Vec<u8> {
        let mut blob = START_CODE.to_vec();
        blob.extend_from_slice(SPS);
        blob.extend_from_slice(&START_CODE);
        blob.extend_from_slice(PPS);
        blob
    }

    #[test]
    fn record_layout() {
        let record = make_avc_config(&annex_b_config()).unwrap();

        assert_eq!(record[0], 1); // configurationVersion
        assert_eq!(record[1], 0x42);
        assert_eq!(record[2], 0x80);
        assert_eq!(record[3], 0x1E);
        assert_eq!(record[4], 0xFF); // 0xFC | 3
        assert_eq!(record[5], 0xE1); // 0xE0 | 1

        let sps_len = u16::from_be_bytes([record[6], record[7]]) as usize;
        assert_eq!(sps_len, SPS.len());
        assert_eq!(&record[8..8 + sps_len], SPS);

        let pps_base = 8 + sps_len;
        assert_eq!(record[pps_base], 1);
        let pps_len = u16::from_be_bytes([record[pps_base + 1], record[pps_base + 2]]) as usize;
        assert_eq!(pps_len, PPS.len());
        assert_eq!(&record[pps_base + 3..pps_base + 3 + pps_len], PPS);
        assert_eq!(record.len(), pps_base + 3 + pps_len);
    }

    #[test]
    fn rejects_missing_leading_start_code() {
        let mut blob = annex_b_config();
        blob[0] = 0xFF;
        assert!(make_avc_config(&blob).is_err());
    }

    #[test]
    fn rejects_single_parameter_set() {
        let mut blob = START_CODE.to_vec();
        blob.extend_from_slice(SPS);
        assert!(make_avc_config(&blob).is_err());
    }

    #[test]
    fn rejects_short_input() {
        assert!(make_avc_config(&[0x00, 0x00, 0x01]).is_err());
    }

    #[test]
    fn strip_removes_only_leading_start_code() {
        let mut payload = START_CODE.to_vec();
        payload.extend_from_slice(&[0x65, 0xAA]);
        assert_eq!(strip_start_code(&payload), &[0x65, 0xAA]);

        let bare = [0x65, 0xAA];
        assert_eq!(strip_start_code(&bare), &bare);

        let short = [0x00, 0x00];
        assert_eq!(strip_start_code(&short), &short);
    }
}
