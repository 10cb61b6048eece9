mod admin;
mod runtime;

use serde_json::{json, Value};

// start(body) -> response, the request body is echoed back
pub fn echo_flow() -> Value {
    json!({
        "nodes": [
            {
                "id": "start",
                "type": "start",
                "label": "Request",
                "pins": [
                    {"id": "out", "node_id": "start", "type": "output", "data_type": "any", "label": "body"}
                ]
            },
            {
                "id": "done",
                "type": "response",
                "label": "Echo",
                "config": {"statusCode": 200},
                "pins": [
                    {"id": "in", "node_id": "done", "type": "input", "data_type": "any", "label": "data"}
                ]
            }
        ],
        "connections": [
            {"id": "c1", "from": {"node_id": "start", "pin_id": "out"}, "to": {"node_id": "done", "pin_id": "in"}}
        ]
    })
}
