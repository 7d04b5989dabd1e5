#![no_main]

use libfuzzer_sys::fuzz_target;
use web_pubsub_client::protocol::{self, ClientMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let (group, payload) = s.split_once('\0').unwrap_or((s, s));

    // Validation either rejects the input or produces valid JSON that
    // parses back into the same message.
    if let Ok(text) = protocol::encode_send_to_group(group, payload) {
        let parsed: ClientMessage = serde_json::from_str(&text).expect("encoded frame parses");
        assert_eq!(
            parsed,
            ClientMessage::SendToGroup {
                group: group.to_owned(),
                data: payload.to_owned(),
            }
        );
    } else {
        assert!(group.trim().is_empty() || payload.trim().is_empty());
    }
});
