//! Basic usage example for the interactive wire protocol.

use interactive_wire::{IdSequence, Method, Packet, ReplyError};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Interactive Wire Protocol Example ===\n");

    // 1. Create a method with the next id
    println!("1. Creating a method...");
    let mut ids = IdSequence::new();
    let method = Method::new(ids.next(), "giveInput", json!({ "controlID": "jump" }), false);

    let frame = Packet::from(method.clone()).encode()?;
    println!("   Encoded frame: {}", frame);

    // 2. Parse it back
    println!("\n2. Parsing the frame...");
    match Packet::parse(&frame)? {
        Packet::Method(parsed) => {
            println!("   Method: {} (id {})", parsed.method, parsed.id);
            println!("   Round trip equal: {}", parsed == method);
        }
        Packet::Reply(reply) => println!("   Unexpected reply {}", reply.id),
    }

    // 3. Answer it
    println!("\n3. Building replies...");
    let ok = Packet::from(method.reply(json!({ "accepted": true }))).encode()?;
    println!("   Success: {}", ok);

    let failed = Packet::from(method.reply_error(ReplyError::new(4004, "invalid arguments").with_path("controlID")))
        .encode()?;
    println!("   Failure: {}", failed);

    // 4. Malformed input is reported, not panicked on
    println!("\n4. Parsing garbage...");
    if let Err(e) = Packet::parse(r#"{"type":"event"}"#) {
        println!("   Rejected: {}", e);
    }

    Ok(())
}
