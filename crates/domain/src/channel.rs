use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown channel '{0}'")]
pub struct UnknownChannel(pub String);

/// The closed set of mutation channels carried in record envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    AccountUpdate,
    AccountDelete,
    AccountUserCreate,
    AccountUserUpdate,
    AccountUserDelete,
    ApplicationCreate,
    ApplicationUpdate,
    ApplicationDelete,
    ApplicationUserUpdate,
    ApplicationUserDelete,
    ConnectionCreate,
    ConnectionConfirm,
    ConnectionUpdate,
    ConnectionAutoConnect,
    ConnectionSocialConnect,
    ConnectionDelete,
    EventCreate,
    EventUpdate,
    EventDelete,
}

impl Channel {
    pub const ALL: [Channel; 19] = [
        Channel::AccountUpdate,
        Channel::AccountDelete,
        Channel::AccountUserCreate,
        Channel::AccountUserUpdate,
        Channel::AccountUserDelete,
        Channel::ApplicationCreate,
        Channel::ApplicationUpdate,
        Channel::ApplicationDelete,
        Channel::ApplicationUserUpdate,
        Channel::ApplicationUserDelete,
        Channel::ConnectionCreate,
        Channel::ConnectionConfirm,
        Channel::ConnectionUpdate,
        Channel::ConnectionAutoConnect,
        Channel::ConnectionSocialConnect,
        Channel::ConnectionDelete,
        Channel::EventCreate,
        Channel::EventUpdate,
        Channel::EventDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::AccountUpdate => "v02_account.update",
            Channel::AccountDelete => "v02_account.delete",
            Channel::AccountUserCreate => "v02_accountUser.create",
            Channel::AccountUserUpdate => "v02_accountUser.update",
            Channel::AccountUserDelete => "v02_accountUser.delete",
            Channel::ApplicationCreate => "v02_application.create",
            Channel::ApplicationUpdate => "v02_application.update",
            Channel::ApplicationDelete => "v02_application.delete",
            Channel::ApplicationUserUpdate => "v02_applicationUser.update",
            Channel::ApplicationUserDelete => "v02_applicationUser.delete",
            Channel::ConnectionCreate => "v02_connection.create",
            Channel::ConnectionConfirm => "v02_connection.confirm",
            Channel::ConnectionUpdate => "v02_connection.update",
            Channel::ConnectionAutoConnect => "v02_connection.autoConnect",
            Channel::ConnectionSocialConnect => "v02_connection.socialConnect",
            Channel::ConnectionDelete => "v02_connection.delete",
            Channel::EventCreate => "v02_event.create",
            Channel::EventUpdate => "v02_event.update",
            Channel::EventDelete => "v02_event.delete",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == value)
            .ok_or_else(|| UnknownChannel(value.to_string()))
    }
}
