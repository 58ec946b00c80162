//! CLI tool to mint an operator JWT for the REST and WebSocket surfaces.

use clap::Parser;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

/// Generate an HS256 operator token
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Operator identity (sub claim)
    #[arg(long, default_value = "operator")]
    sub: String,

    /// Organization the token is scoped to
    #[arg(long, default_value = "org-1")]
    org: String,

    /// Signing secret (must match SKYOPS_JWT_SECRET on the server)
    #[arg(long)]
    secret: String,

    /// Token expiry in hours
    #[arg(long, default_value_t = 24)]
    expiry: u64,
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    org_id: String,
    exp: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let claims = Claims {
        sub: args.sub,
        org_id: args.org,
        exp: (chrono::Utc::now() + chrono::Duration::hours(args.expiry as i64)).timestamp()
            as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(args.secret.as_bytes()),
    )?;
    println!("{}", token);
    Ok(())
}
