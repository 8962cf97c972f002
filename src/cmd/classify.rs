//! `chatforge classify`: print the classifier's verdict for a message.

use chatforge::domain::classify;
use chatforge::engine::dispatcher::strip_mentions;

pub fn cmd_classify(text: &str) {
    let command = classify(&strip_mentions(text));
    println!("{:?}", command);
    if command.is_sessionless() {
        println!("(answered without a session)");
    }
}
