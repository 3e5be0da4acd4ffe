//! RFC 4954 AUTH PLAIN and LOGIN.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use smtpd_common::{internal, logging::visible};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::SessionError,
    peer::{Answer, AuthRequest},
    state::State,
};

use super::{unexpected, Session};

/// Credentials being collected. The password is overwritten with zeros as
/// soon as the credential check has been dispatched.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    pub user: String,
    pub pass: String,
}

impl AuthState {
    pub fn scrub_pass(&mut self) {
        // SAFETY: NUL bytes are valid UTF-8.
        unsafe { self.pass.as_mut_vec() }.fill(0);
        self.pass.clear();
    }

    pub fn clear(&mut self) {
        self.scrub_pass();
        self.user.clear();
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// AUTH PLAIN: the base64 blob is `[authzid] NUL authcid NUL password`,
    /// either on the AUTH line itself or on a `334` continuation.
    pub(crate) async fn auth_plain(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        let arg = match (self.state, arg) {
            (State::Helo, None) => {
                self.state = State::AuthInit;
                return self.reply("334 ").await;
            }
            (State::Helo | State::AuthInit, Some(arg)) => arg,
            (State::AuthInit, None) => return self.auth_abort().await,
            (state, _) => panic!("auth_plain: unknown state {state}"),
        };
        self.state = State::AuthInit;

        let Ok(blob) = BASE64.decode(arg) else {
            return self.auth_abort().await;
        };

        let mut fields = blob.split(|&b| b == 0);
        let (Some(_authzid), Some(user), Some(pass)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return self.auth_abort().await;
        };
        if fields.next().is_some() || user.is_empty() || pass.is_empty() {
            return self.auth_abort().await;
        }
        let (Ok(user), Ok(pass)) = (std::str::from_utf8(user), std::str::from_utf8(pass)) else {
            return self.auth_abort().await;
        };

        self.auth.user = user.to_string();
        self.auth.pass = pass.to_string();
        self.auth_dispatch().await
    }

    /// AUTH LOGIN: username and password are prompted for separately.
    pub(crate) async fn auth_login(&mut self, arg: Option<&str>) -> Result<(), SessionError> {
        match (self.state, arg) {
            (State::Helo, _) => {
                self.state = State::AuthUsername;
                self.reply("334 VXNlcm5hbWU6").await
            }
            (State::AuthUsername, Some(arg)) => {
                let Ok(user) = BASE64.decode(arg) else {
                    return self.auth_abort().await;
                };
                let Ok(user) = String::from_utf8(user) else {
                    return self.auth_abort().await;
                };
                self.auth.user = user;
                self.state = State::AuthPassword;
                self.reply("334 UGFzc3dvcmQ6").await
            }
            (State::AuthPassword, Some(arg)) => {
                let Ok(pass) = BASE64.decode(arg) else {
                    return self.auth_abort().await;
                };
                let Ok(pass) = String::from_utf8(pass) else {
                    return self.auth_abort().await;
                };
                self.auth.pass = pass;
                self.auth_dispatch().await
            }
            (State::AuthUsername | State::AuthPassword, None) => self.auth_abort().await,
            (state, _) => panic!("auth_login: unknown state {state}"),
        }
    }

    async fn auth_dispatch(&mut self) -> Result<(), SessionError> {
        self.park(&self.config.registries.parent_auth);

        let request = AuthRequest {
            reqid: self.id,
            user: self.auth.user.clone(),
            pass: self.auth.pass.clone(),
        };
        let sent = self
            .config
            .peers
            .auth
            .send(request)
            .await
            .map_err(|_| SessionError::PeerGone);
        self.auth.scrub_pass();
        sent?;

        self.state = State::AuthFinalize;
        let success = match self.wait().await? {
            Answer::Auth(reply) => reply.success,
            other => unexpected(&other),
        };

        let user = visible(&self.auth.user);
        if success {
            internal!(
                level = INFO,
                "smtp-in: Accepted authentication for user {user} on session {:016x}",
                self.id
            );
            self.kickcount = 0;
            self.flags.authenticated = true;
            self.reply("235 Authentication succeeded").await?;
        } else {
            internal!(
                level = INFO,
                "smtp-in: Authentication failed for user {user} on session {:016x}",
                self.id
            );
            self.reply("535 Authentication failed").await?;
        }
        self.state = State::Helo;
        Ok(())
    }

    async fn auth_abort(&mut self) -> Result<(), SessionError> {
        self.auth.clear();
        self.state = State::Helo;
        self.reply("501 Syntax error").await
    }
}
