#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("the target mux or stream is closed")]
    Closed,
    #[error("frame codec error")]
    Frame(#[from] contd_proto::FrameError),
}
