pub mod auth_query;
pub mod scram;

// Standard library imports
use std::marker::Unpin;
use std::sync::Arc;

// External crate imports
use log::{error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::auth::auth_query::fetch_password_hash;
use crate::auth::scram::{
    parse_client_final_message, parse_client_first_message, parse_server_secret,
    prepare_server_final_message, prepare_server_first_response,
};
use crate::config::get_config;
use crate::constants::{MD5_PASSWORD_PREFIX, SASL_CONTINUE, SASL_FINAL, SCRAM_SHA_256};
use crate::errors::{ClientIdentifier, Error};
use crate::messages::{
    error_response_terminal, md5_challenge, md5_hash_password, md5_hash_second_pass,
    read_password, scram_server_response, scram_start_challenge, wrong_password,
};
use crate::pool::{resolve, ClientAuth, Route};
use crate::server::ServerParameters;

/// A logged in client: its route (none for console sessions) and the
/// parameters to greet it with.
pub struct Authenticated {
    pub route: Option<Arc<Route>>,
    pub server_parameters: ServerParameters,
}

/// Authenticate a client for the console or for the route of `(database, user)`.
pub async fn authenticate<S, T>(
    read: &mut S,
    write: &mut T,
    admin: bool,
    client_identifier: &ClientIdentifier,
    database: &str,
    username: &str,
) -> Result<Authenticated, Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    if admin {
        authenticate_admin(read, write, username).await?;
        return Ok(Authenticated {
            route: None,
            server_parameters: ServerParameters::admin(),
        });
    }

    let route = match resolve(database, username) {
        Ok(route) => route,
        Err(err) => {
            warn!("Client {client_identifier} has no route: {err}");
            error_response_terminal(write, &err.to_string(), err.sqlstate()).await?;
            return Err(err);
        }
    };

    authenticate_route_user(read, write, &route, username).await?;

    let server_parameters = match route.get_server_parameters().await {
        Ok(params) => params,
        Err(err) => {
            error!(
                "{} Failed to retrieve server parameters for {client_identifier}: {err}",
                route.key
            );
            error_response_terminal(
                write,
                "unable to connect to the database server, please try again later",
                err.sqlstate(),
            )
            .await?;
            return Err(err);
        }
    };

    Ok(Authenticated {
        route: Some(route),
        server_parameters,
    })
}

/// Authenticate the console user with MD5.
async fn authenticate_admin<S, T>(read: &mut S, write: &mut T, username: &str) -> Result<(), Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    let config = get_config();
    if username != config.general.admin_username {
        wrong_password(write, username).await?;
        return Err(Error::AuthError(format!(
            "{username} is not the console user"
        )));
    }
    authenticate_with_md5(read, write, &config.general.admin_password, username).await
}

/// Authenticate a route user with the secret from the config or, when the
/// route delegates to the backend, with the hash the auth query returns.
pub async fn authenticate_route_user<S, T>(
    read: &mut S,
    write: &mut T,
    route: &Route,
    username: &str,
) -> Result<(), Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    match &route.settings.client_auth {
        ClientAuth::Password(secret) => authenticate_with_secret(read, write, secret, username).await,
        ClientAuth::AuthQuery => {
            let hash = match fetch_password_hash(&route.key.database, username).await {
                Ok(hash) => hash,
                Err(err) => {
                    // Do not tell the client whether the user exists.
                    wrong_password(write, username).await?;
                    return Err(err);
                }
            };
            authenticate_with_secret(read, write, &hash, username).await?;
            if !hash.starts_with(SCRAM_SHA_256) {
                route.set_server_password(&hash);
            }
            Ok(())
        }
    }
}

/// Pick the exchange matching the kind of secret.
async fn authenticate_with_secret<S, T>(
    read: &mut S,
    write: &mut T,
    secret: &str,
    username: &str,
) -> Result<(), Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    if secret.starts_with(SCRAM_SHA_256) {
        authenticate_with_scram(read, write, secret, username).await
    } else {
        authenticate_with_md5(read, write, secret, username).await
    }
}

/// Authenticate a user with SCRAM-SHA-256
async fn authenticate_with_scram<S, T>(
    read: &mut S,
    write: &mut T,
    secret: &str,
    username: &str,
) -> Result<(), Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    let server_secret = match parse_server_secret(secret) {
        Ok(server_secret) => server_secret,
        Err(err) => {
            warn!("Failed to parse SCRAM secret of user {username}: {err}");
            error_response_terminal(
                write,
                "server authentication configuration error",
                "28P01",
            )
            .await?;
            return Err(Error::ScramServerError(format!(
                "bad SCRAM secret of user {username}"
            )));
        }
    };

    scram_start_challenge(write).await?;
    let first_message = read_password(read).await?;
    let client_first_message =
        match parse_client_first_message(String::from_utf8_lossy(&first_message)) {
            Ok(client_first_message) => client_first_message,
            Err(err) => {
                warn!("Bad SCRAM client-first-message from user {username}: {err}");
                error_response_terminal(write, "malformed SCRAM message", "08P01").await?;
                return Err(Error::ClientError(format!(
                    "bad SCRAM client-first-message from {username}"
                )));
            }
        };

    let server_first_response = prepare_server_first_response(
        client_first_message.nonce.as_str(),
        client_first_message.client_first_bare.as_str(),
        server_secret.salt_base64.as_str(),
        server_secret.iteration,
    );
    scram_server_response(
        write,
        SASL_CONTINUE,
        server_first_response.server_first_bare.as_str(),
    )
    .await?;

    let final_message = read_password(read).await?;
    let client_final_message =
        match parse_client_final_message(String::from_utf8_lossy(&final_message)) {
            Ok(client_final_message) => client_final_message,
            Err(err) => {
                warn!("Bad SCRAM client-final-message from user {username}: {err}");
                error_response_terminal(write, "malformed SCRAM message", "08P01").await?;
                return Err(Error::ClientError(format!(
                    "bad SCRAM client-final-message from {username}"
                )));
            }
        };

    let server_final_message = match prepare_server_final_message(
        client_first_message,
        client_final_message,
        server_first_response,
        &server_secret.server_key,
        &server_secret.stored_key,
    ) {
        Ok(server_final_message) => server_final_message,
        Err(err) => {
            warn!("SCRAM authentication of user {username} failed: {err}");
            wrong_password(write, username).await?;
            return Err(Error::AuthError(format!(
                "SCRAM authentication failed for user {username}"
            )));
        }
    };
    scram_server_response(write, SASL_FINAL, server_final_message.as_str()).await?;

    Ok(())
}

/// Authenticate a user with MD5 against a plain password or an `md5...` hash.
async fn authenticate_with_md5<S, T>(
    read: &mut S,
    write: &mut T,
    secret: &str,
    username: &str,
) -> Result<(), Error>
where
    S: AsyncReadExt + Unpin,
    T: AsyncWriteExt + Unpin,
{
    let salt = md5_challenge(write).await?;
    let password_response = read_password(read).await?;

    let expected = match secret.strip_prefix(MD5_PASSWORD_PREFIX) {
        Some(hash) if hash.len() == 32 => md5_hash_second_pass(hash, &salt),
        _ => md5_hash_password(username, secret, &salt),
    };

    if expected != password_response {
        warn!("MD5 authentication failed for user {username}");
        wrong_password(write, username).await?;
        return Err(Error::AuthError(format!(
            "MD5 authentication failed for user {username}"
        )));
    }

    Ok(())
}
