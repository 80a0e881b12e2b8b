async fn stream_changes(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.api.subscribe_changes().await;
    ws.on_upgrade(move |socket| stream_socket(socket, rx))
}

async fn stream_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<ChangeNotice>) {
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(notice) => {
                        if send_frame(&mut socket, &StreamFrame::new(notice)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let warning = StreamFrame::new(ChangeNotice::Warning {
                            message: format!("stream client lagged and skipped {skipped} notice(s)"),
                        });

                        if send_frame(&mut socket, &warning).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

#[derive(Debug, Clone, Serialize)]
struct StreamFrame {
    schema_version: String,
    #[serde(flatten)]
    notice: ChangeNotice,
}

impl StreamFrame {
    fn new(notice: ChangeNotice) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            notice,
        }
    }
}
