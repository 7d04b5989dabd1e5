#![no_main]

use libfuzzer_sys::fuzz_target;
use web_pubsub_client::protocol;

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's own UTF-8 validation.
    if let Ok(msg) = protocol::decode(data) {
        // Classification must never panic on arbitrary field contents.
        let _ = msg.message_kind();
        let _ = msg.payload_type();
        let _ = msg.is_group_message(&msg.group);

        // Whatever decoded must survive a re-encode.
        let text = serde_json::to_string(&msg).expect("re-encode decoded message");
        assert_eq!(protocol::decode(text.as_bytes()).ok(), Some(msg));
    }
});
