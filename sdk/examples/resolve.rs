//! Prints everything a running daemon knows about the LAN.
//!
//! ```sh
//! cargo run --example resolve
//! ```

use lnsd_sdk::Client;

fn main() -> Result<(), lnsd_sdk::Error> {
    let mut client = Client::connect(10771)?;

    for (hostname, addrs) in client.mapping()? {
        for addr in addrs {
            println!("{addr} {hostname}");
        }
    }

    Ok(())
}
