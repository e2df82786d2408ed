//! A programmable mock server for the MongoDB wire protocol.
//!
//! A test starts an in-process [`MockServer`], points a real MongoDB client
//! at [`MockServer::uri`], and drives the conversation turn by turn: await
//! each incoming request, assert it matches a pattern, and dictate the
//! reply. Autoresponders absorb repetitive traffic such as handshakes.
//!
//! ```no_run
//! use mockmongo::{MockServer, Matcher};
//! use bson::doc;
//!
//! # async fn example() -> mockmongo::Result<()> {
//! let server = MockServer::new();
//! server.autoresponds("ismaster", doc! {"ok": 1, "maxWireVersion": 6});
//! server.run().await?;
//!
//! // let client = connect_some_driver(&server.uri());
//! // let pending = go(async move { client.insert_one(doc! {"_id": 1}).await });
//! let request = server.receives(Matcher::op_msg("insert", "coll")).await?;
//! request.reply(doc! {"ok": 1}).await?;
//! // assert!(pending.wait().await.is_ok());
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod go;
mod inbox;
pub mod matcher;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod server;
pub mod tls;

pub use config::{AutoIsMaster, FileConfig, ServerOptions};
pub use error::{Error, Result};
pub use go::{go, going, wait_until, wait_until_timeout, GoHandle};
pub use matcher::{absent, Matcher, OpKind};
pub use reply::Reply;
pub use request::Request;
pub use server::{interactive_server, MockServer, ResponderHandle};
