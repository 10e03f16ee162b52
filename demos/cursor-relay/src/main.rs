use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tether::prelude::*;

// ---------------------------------------------------------------------------
// Demo types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cursor {
    x: i32,
    y: i32,
}

type DemoClient =
    PresenceClient<WebSocketRealtime, IssuerTokenProvider, StaticDirectory, Cursor>;

const WORKSPACE: &str = "acme";
const DATABASE: &str = "roadmap";

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with(Profile::new(ClientId::new("ada"), "ada@acme.test", "Ada", "Lovelace"))
        .with(Profile::new(ClientId::new("bob"), "bob@acme.test", "Bob", "Kahn"))
}

fn client(url: &str, issuer: &SharedIssuer, user: &str) -> DemoClient {
    let tokens = IssuerTokenProvider::new(issuer.clone(), ClientId::new(user));
    PresenceClientBuilder::websocket(url, tokens, directory()).build()
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Moves `client`'s cursor diagonally, one step every 50 ms.
async fn walk(client: &DemoClient, steps: i32) -> Result<(), TetherError> {
    for step in 0..steps {
        let cursor = Cursor { x: step, y: step * 2 };
        client
            .set_space_location(WORKSPACE, Some(DATABASE), cursor)
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Waits until `client` sees `expected` members, each with the given
/// final cursor.
async fn settle(
    client: &DemoClient,
    expected: &[(&str, Cursor)],
) -> Result<Vec<Member<Cursor>>, TetherError> {
    let mut members = Vec::new();
    for _ in 0..100 {
        members = client
            .members(WORKSPACE, Some(DATABASE))
            .await?
            .unwrap_or_default();
        let done = members.len() == expected.len()
            && expected.iter().all(|(user, cursor)| {
                members.iter().any(|m| {
                    m.client_id().as_str() == *user && m.location.as_ref() == Some(cursor)
                })
            });
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(members)
}

/// Two users enter the same database view, move their cursors, and
/// report what Ada ends up seeing.
async fn run_demo(url: &str, issuer: &SharedIssuer) -> Result<Vec<Member<Cursor>>, TetherError> {
    let ada = client(url, issuer, "ada");
    let bob = client(url, issuer, "bob");

    ada.enter_space(WORKSPACE, Some(DATABASE), Some(json!({ "color": "tomato" })))
        .await?;
    bob.enter_space(WORKSPACE, Some(DATABASE), Some(json!({ "color": "teal" })))
        .await?;

    tokio::try_join!(walk(&ada, 3), walk(&bob, 5))?;

    let seen = settle(
        &ada,
        &[("ada", Cursor { x: 2, y: 4 }), ("bob", Cursor { x: 4, y: 8 })],
    )
    .await?;
    for member in &seen {
        let name = member
            .profile
            .profile()
            .map_or("(unknown)", |p| p.display_name.as_str());
        tracing::info!(
            member = %member.key,
            name,
            location = ?member.location,
            "seen by ada"
        );
    }

    bob.close().await?;
    ada.close().await?;
    Ok(seen)
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tether::init_tracing();

    let bind = std::env::var("TETHER_BIND").unwrap_or_else(|_| "127.0.0.1:9400".to_string());
    let relay = RelayServer::builder().bind(&bind).build().await?;
    let addr = relay.local_addr()?;
    let issuer = relay.issuer().clone();
    tracing::info!(%addr, "starting cursor relay demo");

    tokio::spawn(async move {
        if let Err(e) = relay.run().await {
            tracing::error!(error = %e, "relay stopped");
        }
    });

    let seen = run_demo(&format!("ws://{addr}"), &issuer).await?;
    tracing::info!(members = seen.len(), "demo finished");
    Ok(())
}
