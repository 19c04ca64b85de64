use std::{
    fs,
    net::{SocketAddr, TcpStream},
    path::Path,
    process::Command,
    thread::sleep,
    time::Duration,
};

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};

#[tokio::test]
async fn quota_over_http() {
    let exe = env!("CARGO_PKG_NAME");
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path();

    let wordgate::conf::Conf { addr, port, .. } = setup_conf(dir);
    let cmd = || {
        let mut cmd = Command::cargo_bin(exe).unwrap();
        cmd.arg("--dir").arg(dir);
        cmd
    };

    cmd().args(["user", "add", "ada@example.com"]).assert().success();
    let output = cmd()
        .args(["jwt", "ada@example.com", "300"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let token = String::from_utf8(output).unwrap().trim().to_string();

    let sock_addr: SocketAddr = format!("{addr}:{port}").parse().unwrap();
    assert!(server_is_not_listening(&sock_addr));
    let mut server = cmd().arg("server").spawn().unwrap();
    assert!(server_is_listening(&sock_addr));

    let client = reqwest::Client::new();
    let post = |text: &'static str| {
        client
            .post(format!("http://{addr}:{port}/text"))
            .bearer_auth(&token)
            .body(text)
            .send()
    };
    let admitted = post("one two three").await;
    let rejected = post("four five six").await;
    let blank = post("  ").await;
    let anonymous = client
        .post(format!("http://{addr}:{port}/text"))
        .body("hello")
        .send()
        .await;

    // XXX Stop the server BEFORE asserting, because if any assert fails
    //     we will not get a chance to clean-up.
    server.kill().unwrap();

    assert_eq!(admitted.unwrap().status(), reqwest::StatusCode::OK);
    assert_eq!(
        rejected.unwrap().status(),
        reqwest::StatusCode::PAYMENT_REQUIRED
    );
    assert_eq!(blank.unwrap().status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(
        anonymous.unwrap().status(),
        reqwest::StatusCode::UNAUTHORIZED
    );

    let output = cmd()
        .args(["user", "show", "ada@example.com"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stats: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(stats["words_used_today"], 3);
    assert_eq!(stats["words_remaining"], 2);
}

fn setup_conf(workdir: &Path) -> wordgate::conf::Conf {
    let conf = wordgate::conf::Conf {
        log_level: tracing::Level::INFO,
        addr: "127.0.0.1".parse().unwrap(),
        port: 7311,
        max_words_per_day: 5,
        jwt: wordgate::conf::ConfJwt {
            secret: "fake-secret".to_string(),
            audience: "fake-audience".to_string(),
            issuer: "fake-issuer".to_string(),
        },
        ..Default::default()
    };
    let conf_str = toml::to_string(&conf).unwrap();
    let conf_dir = workdir.join("conf");
    fs::create_dir_all(&conf_dir).unwrap();
    fs::write(conf_dir.join("conf.toml"), &conf_str).unwrap();
    conf
}

fn server_is_not_listening(addr: &SocketAddr) -> bool {
    TcpStream::connect(addr).is_err()
}

fn server_is_listening(addr: &SocketAddr) -> bool {
    let interval = Duration::from_secs_f32(0.25);
    let attempts = 20;
    retry_until_true(|| TcpStream::connect(addr).is_ok(), interval, attempts)
}

fn retry_until_true<F: Fn() -> bool>(
    f: F,
    interval: Duration,
    mut attempts: usize,
) -> bool {
    while attempts > 0 {
        if f() {
            return true;
        } else {
            attempts -= 1;
            sleep(interval);
        }
    }
    false
}
