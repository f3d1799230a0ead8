#![allow(dead_code)]

use std::thread;

use rclink::{Config, OobListener, RcEndpoint, RcError};

/// Client-side view of a listener bound on an ephemeral port.
pub fn client_config(port: u16, base: &Config) -> Config {
    Config {
        server_name: Some("127.0.0.1".to_string()),
        tcp_port: port,
        ..base.clone()
    }
}

/// Run the listener on a thread and the connector on this one.
pub fn try_connect_pair(
    server: Config,
    client: Config,
) -> (Result<RcEndpoint, RcError>, Result<RcEndpoint, RcError>) {
    let listener = OobListener::bind(0).expect("failed to bind");
    let port = listener.local_port();
    let server = thread::spawn(move || RcEndpoint::accept(&server, listener));
    let client = RcEndpoint::connect(&client_config(port, &client));
    (server.join().expect("server thread panicked"), client)
}

pub fn connect_pair(server: Config, client: Config) -> (RcEndpoint, RcEndpoint) {
    let (server, client) = try_connect_pair(server, client);
    (
        server.expect("server failed to connect"),
        client.expect("client failed to connect"),
    )
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
