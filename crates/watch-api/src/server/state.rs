#[derive(Clone)]
struct AppState {
    api: Arc<WatchApi>,
}
