//! Drives `serve` over an in-memory stream the way a socket client would.

use cardreader_rpc_server::codec::{read_frame, write_frame};
use cardreader_rpc_server::server::serve;
use cardreader_rpc_server::{
    BackendKind, RpcRequest, RpcResponse, ServerConfig, Session, TimerRequest,
};
use tokio::io::{duplex, split};

#[tokio::test]
async fn test_session_over_stream() {
    let (client, server) = duplex(4096);
    let (server_rd, server_wr) = split(server);
    let (mut client_rd, mut client_wr) = split(client);
    let session = Session::new(&ServerConfig::default());

    let client = async move {
        let mut replies = Vec::new();
        for request in [
            RpcRequest::Create {
                backend: Some(BackendKind::Uart),
            },
            RpcRequest::Plugged,
            RpcRequest::Unplugged,
            RpcRequest::Destroy,
        ] {
            write_frame(&mut client_wr, &request).await.unwrap();
            let reply: RpcResponse = read_frame(&mut client_rd).await.unwrap().unwrap();
            replies.push(reply);
        }
        drop(client_wr);
        replies
    };

    let (handled, replies) = tokio::join!(serve(server_rd, server_wr, session), client);
    assert_eq!(handled.unwrap(), 4);
    assert!(replies.iter().all(RpcResponse::is_ok));

    let plugged = &replies[1];
    assert_eq!(plugged.to_reader.len(), 1);
    assert_eq!(&plugged.to_reader[0][..2], &[0x5A, 0xA5]);
    assert!(matches!(plugged.timers[..], [TimerRequest::Start { .. }]));
    assert!(replies[2]
        .events
        .iter()
        .any(|event| event.contains("reader disconnected")));
}
