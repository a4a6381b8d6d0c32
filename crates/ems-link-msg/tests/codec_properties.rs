//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON-RPC message model and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use ems_link_msg::{
    decode, encode, Message, Notification, Request, ResponseError, ResponseSuccess, RpcError,
};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

fn json_leaf() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        Just(JsonValue::Null),
        any::<bool>().prop_map(JsonValue::from),
        any::<i64>().prop_map(JsonValue::from),
        "[a-zA-Z0-9 _/-]{0,12}".prop_map(JsonValue::from),
    ]
}

fn json_object() -> impl Strategy<Value = JsonValue> {
    let value = json_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::from),
            proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| JsonValue::Object(map.into_iter().collect())),
        ]
    });
    proptest::collection::btree_map("[a-zA-Z_/]{1,10}", value, 0..5)
        .prop_map(|map| JsonValue::Object(map.into_iter().collect()))
}

/// Error details, including an explicit `null` that must not collapse to absent.
fn error_data() -> impl Strategy<Value = Option<JsonValue>> {
    prop_oneof![
        Just(None),
        Just(Some(JsonValue::Null)),
        json_object().prop_map(Some),
    ]
}

fn message() -> impl Strategy<Value = Message> {
    let id = "[a-f0-9-]{1,36}";
    let method = "[a-zA-Z]{1,24}";
    prop_oneof![
        (id, method, json_object())
            .prop_map(|(id, method, params)| Message::from(Request::with_id(id, method, params))),
        (method, json_object())
            .prop_map(|(method, params)| Message::from(Notification::new(method, params))),
        (id, json_object())
            .prop_map(|(id, result)| Message::from(ResponseSuccess { id, result })),
        (id, any::<i64>(), "[a-z ]{0,20}", error_data()).prop_map(
            |(id, code, message, data)| {
                Message::from(ResponseError {
                    id,
                    error: RpcError {
                        code,
                        message,
                        data,
                    },
                })
            }
        ),
    ]
}

proptest! {
    #[test]
    fn decode_inverts_encode(message in message()) {
        let decoded = decode(&encode(&message)).expect("encoded frames decode");
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_text(text in ".{0,256}") {
        let _ = decode(&text);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_json(value in json_object()) {
        let _ = decode(&value.to_string());
    }
}

#[test]
fn application_error_keeps_code_and_details() {
    let frame = json!({
        "jsonrpc": "2.0",
        "id": "c2",
        "error": {"code": 1, "message": "already exists", "data": {"componentId": "meter0"}}
    })
    .to_string();
    match decode(&frame).expect("valid error frame") {
        Message::Error(response) => {
            assert_eq!(response.id, "c2");
            assert_eq!(response.error.code, 1);
            assert_eq!(response.error.message, "already exists");
            assert_eq!(response.error.data, Some(json!({"componentId": "meter0"})));
        }
        other => panic!("expected error response, got {other:?}"),
    }
}
