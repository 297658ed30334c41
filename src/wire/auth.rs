// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Challenge/response authentication.
//!
//! The alternating MD5/SHA-256 mix is deliberate: it prevents cheap
//! hardware acceleration by a single hash engine. "(MD5∘SHA-256)^n" reads
//! as the pipeline "hash with MD5, then with SHA-256" applied n times,
//! yielding a 32-byte value matching the wire's `ChallengeResponse` field —
//! see DESIGN.md for this interpretation call.

use anyhow::{Context, Result, bail, ensure};
use md5::Md5;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::magic::{
    MAX_STATE_RESPONSE_SIZE, STATE_AUTHENTICATED, STATE_HOT, STATE_NOT_AUTHENTICATED,
};

pub const RANDOM_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const MIN_ITER: u16 = 10_000;
pub const MAX_ITER: u16 = 20_000;
const PROTOCOL_VERSION: u16 = 1;

/// Step 1 of the handshake: the peer's iteration count, random challenge,
/// and protocol version (wire layout: `u16 iter | [32]u8 random | u16
/// version`).
#[derive(Debug, Clone)]
pub struct Challenge {
    pub iterations: u16,
    pub random: [u8; RANDOM_LEN],
    pub version: u16,
}

impl Challenge {
    /// Generates a fresh challenge with `iterations` drawn from
    /// `[MIN_ITER, MAX_ITER)`.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let iterations = rng.random_range(MIN_ITER..MAX_ITER);
        let mut random = [0u8; RANDOM_LEN];
        rng.fill(&mut random);
        Self { iterations, random, version: PROTOCOL_VERSION }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_u16_le(self.iterations).await?;
        w.write_all(&self.random).await?;
        w.write_u16_le(self.version).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let iterations = r.read_u16_le().await?;
        let mut random = [0u8; RANDOM_LEN];
        r.read_exact(&mut random).await?;
        let version = r.read_u16_le().await?;
        ensure!(
            (MIN_ITER..MAX_ITER).contains(&iterations),
            "challenge iteration count {iterations} outside [{MIN_ITER}, {MAX_ITER})"
        );
        Ok(Self { iterations, random, version })
    }
}

/// Step 2: `ChallengeResponse = ((MD5∘SHA-256)^iter)(SHA-512(random ‖
/// AuthHash))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse(pub [u8; HASH_LEN]);

impl ChallengeResponse {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.0).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HASH_LEN];
        r.read_exact(&mut buf).await?;
        Ok(Self(buf))
    }
}

/// Step 3: the peer's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    NotAuthenticated,
    Hot,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateResponseWire {
    id: u32,
    info: String,
}

#[derive(Debug, Clone)]
pub struct StateResponse {
    pub state: AuthState,
    pub info: String,
}

impl StateResponse {
    pub fn new(state: AuthState, info: impl Into<String>) -> Self {
        Self { state, info: info.into() }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let id = match self.state {
            AuthState::Authenticated => STATE_AUTHENTICATED,
            AuthState::NotAuthenticated => STATE_NOT_AUTHENTICATED,
            AuthState::Hot => STATE_HOT,
        };
        let wire = StateResponseWire { id, info: self.info.clone() };
        crate::wire::framer::write_len_prefixed_json_u16(
            w,
            &wire,
            MAX_STATE_RESPONSE_SIZE,
        )
        .await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let wire: StateResponseWire =
            crate::wire::framer::read_len_prefixed_json_u16(r, MAX_STATE_RESPONSE_SIZE)
                .await?;
        let state = match wire.id {
            STATE_AUTHENTICATED => AuthState::Authenticated,
            STATE_NOT_AUTHENTICATED => AuthState::NotAuthenticated,
            STATE_HOT => AuthState::Hot,
            other => bail!("unknown StateResponse id 0x{other:08x}"),
        };
        Ok(Self { state, info: wire.info })
    }
}

/// One round of the deliberately-slow mix: MD5 then SHA-256.
fn mix_round(input: &[u8]) -> [u8; HASH_LEN] {
    let md5_digest = Md5::digest(input);
    let sha256_digest = Sha256::digest(md5_digest);
    sha256_digest.into()
}

/// Derives the long-lived AuthHash from a shared secret:
/// `SHA-512(secret)` seeded through 16 rounds of [`mix_round`].
pub fn derive_auth_hash(secret: &[u8]) -> [u8; HASH_LEN] {
    let seed = Sha512::digest(secret);
    let mut cur = mix_round(&seed);
    for _ in 1..16 {
        cur = mix_round(&cur);
    }
    cur
}

/// Computes the `ChallengeResponse` for a given challenge.
pub fn compute_challenge_response(
    secret: &[u8],
    random: &[u8; RANDOM_LEN],
    iterations: u16,
) -> ChallengeResponse {
    let auth_hash = derive_auth_hash(secret);
    let mut seed_input = Vec::with_capacity(RANDOM_LEN + HASH_LEN);
    seed_input.extend_from_slice(random);
    seed_input.extend_from_slice(&auth_hash);
    let seed = Sha512::digest(&seed_input);

    let mut cur = mix_round(&seed);
    for _ in 1..iterations {
        cur = mix_round(&cur);
    }
    ChallengeResponse(cur)
}

/// Runs the client side of the three-step handshake over an already-open
/// connection and returns once the peer has replied `HOT` (after the caller
/// sends its own closing `HOT` StateResponse — see
/// [`crate::connection::IngestConnection::authenticate`]).
pub async fn client_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    secret: Option<&str>,
) -> Result<()> {
    let challenge = Challenge::read(stream).await.context("reading auth challenge")?;

    let response = compute_challenge_response(
        secret.unwrap_or("").as_bytes(),
        &challenge.random,
        challenge.iterations,
    );
    response.write(stream).await.context("writing challenge response")?;

    let verdict = StateResponse::read(stream).await.context("reading auth verdict")?;
    match verdict.state {
        AuthState::Authenticated => Ok(()),
        AuthState::NotAuthenticated => {
            bail!("authentication refused: {}", verdict.info)
        },
        AuthState::Hot => bail!("peer sent HOT before authentication completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_hash_is_deterministic_and_secret_dependent() {
        let a = derive_auth_hash(b"secret-one");
        let b = derive_auth_hash(b"secret-one");
        let c = derive_auth_hash(b"secret-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn challenge_response_depends_on_all_inputs() {
        let random = [7u8; RANDOM_LEN];
        let r1 = compute_challenge_response(b"shared", &random, 10_000);
        let r2 = compute_challenge_response(b"shared", &random, 10_001);
        let r3 = compute_challenge_response(b"other", &random, 10_000);
        assert_ne!(r1, r2);
        assert_ne!(r1, r3);
    }

    #[tokio::test]
    async fn challenge_round_trips_over_a_byte_buffer() {
        let c = Challenge::generate();
        let mut buf = Vec::new();
        c.write(&mut buf).await.expect("write");
        let mut cur = std::io::Cursor::new(buf);
        let decoded = Challenge::read(&mut cur).await.expect("read");
        assert_eq!(c.iterations, decoded.iterations);
        assert_eq!(c.random, decoded.random);
        assert_eq!(c.version, decoded.version);
    }

    #[tokio::test]
    async fn state_response_round_trips() {
        let s = StateResponse::new(AuthState::Hot, "ready");
        let mut buf = Vec::new();
        s.write(&mut buf).await.expect("write");
        let mut cur = std::io::Cursor::new(buf);
        let decoded = StateResponse::read(&mut cur).await.expect("read");
        assert_eq!(decoded.state, AuthState::Hot);
        assert_eq!(decoded.info, "ready");
    }
}
