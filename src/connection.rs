use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::frame::Frame;
use crate::Error;

/// A peer speaking RESP over TCP. Inbound bytes are buffered until they hold a whole frame; a
/// frame split across several reads is handed out only once its last byte arrives.
pub struct Connection {
    pub id: Uuid,
    framed: Framed<TcpStream, FrameCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Returns `None` once the peer closes the connection between frames. Closing in the middle
    /// of a frame is an error.
    #[instrument(name = "read_frame", skip(self), fields(connection_id = %self.id))]
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        match self.framed.next().await {
            Some(frame) => {
                let frame = frame?;
                debug!("received frame: {}", frame);
                Ok(Some(frame))
            }
            None => {
                debug!("connection closed by peer");
                Ok(None)
            }
        }
    }

    #[instrument(name = "write_frame", skip(self, frame), fields(connection_id = %self.id))]
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        debug!("sending frame: {}", frame);
        self.framed.send(frame.clone()).await
    }
}
