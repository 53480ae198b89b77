use std::time::Duration;

use sideport_agent::{decode_response, encode_line, Request, Response};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tracing::debug;

use crate::failure::Failure;

const AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One connection to a guest agent. The welcome line is consumed on connect.
pub(crate) struct AgentClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    welcome: Response,
}

fn unreachable_agent(addr: &str, err: impl std::fmt::Display) -> Failure {
    Failure::new("agent.unreachable", format!("guest agent at {addr}: {err}"))
}

impl AgentClient {
    pub(crate) async fn connect(addr: &str) -> Result<Self, Failure> {
        let stream = tokio::time::timeout(AGENT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| unreachable_agent(addr, "connect timed out"))?
            .map_err(|err| unreachable_agent(addr, err))?;
        let (reader, writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let welcome = read_response(&mut lines).await?;
        debug!("agent {addr}: {welcome:?}");
        Ok(Self {
            lines,
            writer,
            welcome,
        })
    }

    pub(crate) fn welcome(&self) -> &Response {
        &self.welcome
    }

    pub(crate) async fn request(&mut self, request: &Request) -> Result<Response, Failure> {
        let line = encode_line(request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        read_response(&mut self.lines).await
    }
}

async fn read_response(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Response, Failure> {
    let line = tokio::time::timeout(AGENT_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Failure::new("agent.timeout", "no response from guest agent"))??
        .ok_or_else(|| Failure::new("agent.closed", "guest agent closed the connection"))?;
    Ok(decode_response(&line)?)
}
