//! Ultima Online wire protocol (login phase only)

pub mod packets;
pub mod string;

pub use packets::{
    build_account_login_reject, build_play_server, build_remote_ip, build_server_list, command,
    ServerListEntry, ACCOUNT_LOGIN_PASSWORD, ACCOUNT_LOGIN_SIZE, ACCOUNT_LOGIN_USERNAME,
    EXTENDED_REMOTE_IP, GAME_LOGIN_SIZE, HANDSHAKE_SIZE, PLAY_SERVER_SIZE, REJECT_BAD_PASSWORD,
    SEED_SIZE, SERVER_LIST_SENTINEL_IP,
};
pub use string::{extract_cstr, is_valid_username, username_str};
