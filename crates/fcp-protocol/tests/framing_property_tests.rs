//! 控制 socket 帧重组的属性测试

use fcp_protocol::{
    FirmwarePayload, FrameAssembler, HEADER_LEN, MessageHeader, RequestType, Response,
    encode_firmware_request, encode_progress,
};
use proptest::prelude::*;

/// 把消息切成任意片段依次送入重组器
fn feed_in_pieces(assembler: &mut FrameAssembler, bytes: &[u8], cuts: &[usize]) -> usize {
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    cuts.push(0);
    cuts.push(bytes.len());
    cuts.sort_unstable();
    cuts.dedup();

    let mut dispatched = 0;
    for window in cuts.windows(2) {
        assembler.extend(&bytes[window[0]..window[1]]);
        while let Some(request) = assembler.next_request().unwrap() {
            assert_eq!(request.payload.len(), bytes.len() - HEADER_LEN);
            dispatched += 1;
        }
    }
    dispatched
}

proptest! {
    /// 测试任意拆分的请求恰好重组为一条消息
    #[test]
    fn split_request_reassembles_once(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        cuts in prop::collection::vec(any::<usize>(), 0..32),
    ) {
        let payload = FirmwarePayload {
            usb_vid: 0x1235,
            usb_pid: 0x821d,
            sha256: [0x5A; 32],
            md5: [0xA5; 16],
            data: &data,
        };
        let bytes = encode_firmware_request(RequestType::AppFirmwareUpdate, &payload);
        let mut assembler = FrameAssembler::default();
        prop_assert_eq!(feed_in_pieces(&mut assembler, &bytes, &cuts), 1);
        prop_assert_eq!(assembler.bytes_read(), 0);
    }

    /// 测试逐字节送入的无负载请求
    #[test]
    fn byte_at_a_time(msg_type in 0u8..=255, len in 0u32..64) {
        let mut bytes = MessageHeader { magic: fcp_protocol::REQUEST_MAGIC, msg_type, payload_length: len }
            .encode()
            .to_vec();
        bytes.extend(std::iter::repeat_n(0xEEu8, len as usize));

        let mut assembler = FrameAssembler::default();
        let mut seen = Vec::new();
        for b in &bytes {
            assembler.extend(std::slice::from_ref(b));
            if let Some(request) = assembler.next_request().unwrap() {
                seen.push(request);
            }
        }
        prop_assert_eq!(seen.len(), 1);
        prop_assert_eq!(seen[0].msg_type, msg_type);
        prop_assert_eq!(seen[0].payload.len(), len as usize);
    }

    /// 测试进度帧解码结果不超过 100
    #[test]
    fn progress_frame_in_range(percent in any::<u8>()) {
        let frame = encode_progress(percent);
        let header = MessageHeader::decode(&frame).unwrap();
        match Response::decode(&header, &frame[HEADER_LEN..]).unwrap() {
            Response::Progress(p) => prop_assert!(p <= 100),
            other => prop_assert!(false, "unexpected response {:?}", other),
        }
    }
}
