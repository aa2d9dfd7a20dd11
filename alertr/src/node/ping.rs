use std::time::Instant;

use alertr_lib::Communication;
use alertr_lib::message::builder;

use crate::internal_prelude::*;

/// Send `count` pings and print how long each took.
pub fn ping(communication: &Communication, count: u32) -> Result<()> {
    let mut failed = 0;
    for number in 1..=count {
        let start = Instant::now();
        let promise = communication.send_request("ping", &builder::ping().to_json()?);

        if promise.was_successful() {
            println!("Ping {number}: {}ms", start.elapsed().as_millis());
        } else {
            println!("Ping {number}: failed");
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} of {count} pings failed.");
    }

    Ok(())
}
