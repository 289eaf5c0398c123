#![no_main]

use gamewire::core::decoder::{BinaryPacketDecoder, PendingPacket};
use gamewire::DataCollection;
use gamewire::DataType;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Stream decoding across an arbitrary split must never panic
    let decoder = BinaryPacketDecoder::new().with_max_payload_size(64 * 1024);
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut pending = PendingPacket::new();
    if let Ok(frames) = decoder.decode(&mut pending, &data[..split]) {
        for frame in frames {
            let _ = frame.to_collection();
        }
    }
    let _ = decoder.decode(&mut pending, &data[split..]);

    let _ = decoder.decode_datagram(data);
    let _ = DataCollection::deserialize(DataType::Zero, data);
    let _ = DataCollection::deserialize(DataType::MsgPack, data);
});
