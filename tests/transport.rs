//! Transport behavior observed through the client: endpoint failover and the
//! RESPONSE_TOO_BIG datagram-to-stream retry.

use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag10, ExplicitContextTag4, ExplicitContextTag5,
    ExplicitContextTag6, ExplicitContextTag9, IntegerAsn1, Optional,
};
use picky_asn1::date::GeneralizedTime;
use picky_krb::constants::types::KRB_ERROR_MSG_TYPE;
use picky_krb::data_types::{KerberosTime, Microseconds, Realm};
use picky_krb::messages::{KrbError, KrbErrorInner};
use time::OffsetDateTime;
use tokio::net::{TcpListener, UdpSocket};

use kerberos::client::{Credentials, KerberosClient};
use kerberos::config::ClientConfig;
use kerberos::kdc::{Kdc, KdcServer, RealmDirectory, RealmStore};
use kerberos::principal::PrincipalName;
use kerberos::KrbErrorCode;

const REALM: &str = "EXAMPLE.COM";

const REALM_DATA: &str = r#"
    realm = "EXAMPLE.COM"

    [principals."krbtgt/EXAMPLE.COM"]
    password = "krbtgt-master-secret"

    [principals.alice]
    password = "alice-password"
"#;

async fn start_kdc() -> KdcServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut store = RealmStore::new();
    store.add(RealmDirectory::from_data(REALM_DATA).unwrap());

    KdcServer::bind("127.0.0.1:0".parse().unwrap(), Kdc::with_realms(store))
        .await
        .unwrap()
}

fn alice() -> Credentials {
    Credentials::new(PrincipalName::client("alice", REALM).unwrap(), "alice-password")
}

/// A KRB-ERROR with the given code, as a KDC would frame it on UDP.
fn canned_error(code: KrbErrorCode) -> Vec<u8> {
    let now = OffsetDateTime::now_utc();
    let error = KrbError::from(KrbErrorInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![kerberos::KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_ERROR_MSG_TYPE])),
        ctime: Optional::from(None),
        cusec: Optional::from(None),
        stime: ExplicitContextTag4::from(KerberosTime::from(GeneralizedTime::from(now))),
        susec: ExplicitContextTag5::from(Microseconds::from(0_u32.to_be_bytes().to_vec())),
        error_code: ExplicitContextTag6::from(code as u32),
        crealm: Optional::from(None),
        cname: Optional::from(None),
        realm: ExplicitContextTag9::from(Realm::from(IA5String::from_string(REALM.to_owned()).unwrap())),
        sname: ExplicitContextTag10::from(PrincipalName::tgs(REALM).unwrap().to_asn1().unwrap()),
        e_text: Optional::from(None),
        e_data: Optional::from(None),
    });

    picky_asn1_der::to_vec(&error).unwrap()
}

/// A fake datagram KDC that answers every request with the same bytes.
async fn udp_responder(reply: Vec<u8>) -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0_u8; 4096];
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&reply, peer).await.is_err() {
                break;
            }
        }
    });

    format!("udp://127.0.0.1:{}", addr.port())
}

async fn dead_tcp_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    format!("tcp://127.0.0.1:{}", addr.port())
}

#[tokio::test]
async fn response_too_big_is_retried_over_a_stream() {
    let server = start_kdc().await;
    let too_big = udp_responder(canned_error(KrbErrorCode::KrbErrResponseTooBig)).await;

    // UDP is preferred; every datagram answer says the reply will not fit
    let mut config = ClientConfig::new(REALM);
    config.pin_kdc(REALM, &too_big).unwrap();
    config.pin_kdc(REALM, &format!("tcp://{}", server.local_addr())).unwrap();

    let client = KerberosClient::new(config).unwrap();
    let tgt = client.authenticate(&alice()).await.unwrap();

    assert_eq!(tgt.service, PrincipalName::tgs(REALM).unwrap());

    server.shutdown().await;
}

#[tokio::test]
async fn other_datagram_errors_are_not_retried() {
    let server = start_kdc().await;
    let generic = udp_responder(canned_error(KrbErrorCode::KrbErrGeneric)).await;

    // the TCP KDC would answer correctly, but a protocol error on UDP is a
    // final answer, not a transport failure
    let mut config = ClientConfig::new(REALM);
    config.pin_kdc(REALM, &generic).unwrap();
    config.pin_kdc(REALM, &format!("tcp://{}", server.local_addr())).unwrap();

    let client = KerberosClient::new(config).unwrap();
    let err = client.authenticate(&alice()).await.unwrap_err();

    assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbErrGeneric));

    server.shutdown().await;
}

#[tokio::test]
async fn dead_endpoint_fails_over_to_the_next() {
    let server = start_kdc().await;
    let dead = dead_tcp_endpoint().await;

    let mut config = ClientConfig::new(REALM);
    config.pin_kdc(REALM, &dead).unwrap();
    config.pin_kdc(REALM, &format!("tcp://{}", server.local_addr())).unwrap();
    config.exchange_timeout = std::time::Duration::from_millis(500);

    let client = KerberosClient::new(config).unwrap();
    let tgt = client.authenticate(&alice()).await.unwrap();

    assert_eq!(tgt.client, PrincipalName::client("alice", REALM).unwrap());

    server.shutdown().await;
}
