//! End-to-end exchanges between [`KerberosClient`] and a [`KdcServer`] over
//! loopback TCP: initial authentication with and without pre-authentication,
//! service tickets, constrained delegation, renewal, and password failures.

use kerberos::client::{Credentials, KerberosClient};
use kerberos::config::ClientConfig;
use kerberos::flags::TicketFlags;
use kerberos::kdc::{Kdc, KdcServer, RealmDirectory, RealmStore};
use kerberos::principal::PrincipalName;
use kerberos::KrbErrorCode;
use time::Duration;

const REALM: &str = "EXAMPLE.COM";

const REALM_DATA: &str = r#"
    realm = "EXAMPLE.COM"

    [principals."krbtgt/EXAMPLE.COM"]
    password = "krbtgt-master-secret"

    [principals.alice]
    password = "alice-password"

    [principals.bob]
    password = "bob-password"
    requires_preauth = false

    [principals."HTTP/web.example.com"]
    password = "web-service-secret"
    delegation_targets = ["cifs/files.example.com"]

    [principals."cifs/files.example.com"]
    password = "files-service-secret"
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

fn client_for(server: &KdcServer, configure: impl FnOnce(&mut ClientConfig)) -> KerberosClient {
    let mut config = ClientConfig::new(REALM);
    config
        .pin_kdc(REALM, &format!("tcp://{}", server.local_addr()))
        .unwrap();
    configure(&mut config);

    KerberosClient::new(config).unwrap()
}

fn alice() -> Credentials {
    Credentials::new(PrincipalName::client("alice", REALM).unwrap(), "alice-password")
}

fn web_service() -> Credentials {
    Credentials::new(
        PrincipalName::service("HTTP", "web.example.com", REALM).unwrap(),
        "web-service-secret",
    )
}

#[tokio::test]
async fn authenticate_with_encrypted_timestamp_preauth() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});

    let tgt = client.authenticate(&alice()).await.unwrap();

    assert_eq!(tgt.client, PrincipalName::client("alice", REALM).unwrap());
    assert_eq!(tgt.service, PrincipalName::tgs(REALM).unwrap());
    assert_ne!(tgt.flags & TicketFlags::INITIAL.bits(), 0);
    assert_ne!(tgt.flags & TicketFlags::PRE_AUTHENT.bits(), 0);
    assert!(tgt.end_time > tgt.auth_time);

    server.shutdown().await;
}

#[tokio::test]
async fn principal_without_preauth_authenticates_in_one_round() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let bob = Credentials::new(PrincipalName::client("bob", REALM).unwrap(), "bob-password");

    let tgt = client.authenticate(&bob).await.unwrap();

    assert_ne!(tgt.flags & TicketFlags::INITIAL.bits(), 0);
    assert_eq!(tgt.flags & TicketFlags::PRE_AUTHENT.bits(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_password_fails_preauth() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let imposter = Credentials::new(PrincipalName::client("alice", REALM).unwrap(), "not-her-password");

    let err = client.authenticate(&imposter).await.unwrap_err();

    assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KdcErrPreauthFailed));

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_principal_is_rejected() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let stranger = Credentials::new(PrincipalName::client("mallory", REALM).unwrap(), "whatever");

    let err = client.authenticate(&stranger).await.unwrap_err();

    assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KdcErrCPrincipalUnknown));

    server.shutdown().await;
}

#[tokio::test]
async fn service_ticket_via_tgs_exchange() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let web = PrincipalName::service("HTTP", "web.example.com", REALM).unwrap();

    // no TGT cached yet; this runs AS then TGS
    let ticket = client.service_ticket(&alice(), &web).await.unwrap();

    assert_eq!(ticket.client, PrincipalName::client("alice", REALM).unwrap());
    assert_eq!(ticket.service, web);
    // a service ticket is not an initial one
    assert_eq!(ticket.flags & TicketFlags::INITIAL.bits(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn second_request_is_served_from_the_cache() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let web = PrincipalName::service("HTTP", "web.example.com", REALM).unwrap();

    let first = client.service_ticket(&alice(), &web).await.unwrap();
    server.shutdown().await;

    // the KDC is gone; only the cache can answer now
    let second = client.service_ticket(&alice(), &web).await.unwrap();

    assert_eq!(first.session_key.as_bytes(), second.session_key.as_bytes());
    assert_eq!(first.end_time, second.end_time);
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let ghost = PrincipalName::service("ldap", "nowhere.example.com", REALM).unwrap();

    let err = client.service_ticket(&alice(), &ghost).await.unwrap_err();

    assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KdcErrSPrincipalUnknown));

    server.shutdown().await;
}

#[tokio::test]
async fn s4u2self_then_s4u2proxy_delegation() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let service = web_service();
    let alice_principal = PrincipalName::client("alice", REALM).unwrap();

    // the web service obtains evidence that alice authenticated to it
    let evidence = client.impersonate(&service, &alice_principal).await.unwrap();
    assert_eq!(evidence.client, alice_principal);
    assert_eq!(evidence.service, service.client);
    assert_ne!(evidence.flags & TicketFlags::FORWARDABLE.bits(), 0);

    // and trades it for a backend ticket still in alice's name
    let backend = PrincipalName::service("cifs", "files.example.com", REALM).unwrap();
    let delegated = client.delegate(&service, &evidence, &backend).await.unwrap();

    assert_eq!(delegated.client, alice_principal);
    assert_eq!(delegated.service, backend);

    server.shutdown().await;
}

#[tokio::test]
async fn delegation_outside_the_allow_list_is_refused() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});
    let service = web_service();
    let alice_principal = PrincipalName::client("alice", REALM).unwrap();

    let evidence = client.impersonate(&service, &alice_principal).await.unwrap();

    // krbtgt is not among the web service's delegation targets
    let off_limits = PrincipalName::tgs(REALM).unwrap();
    let err = client.delegate(&service, &evidence, &off_limits).await.unwrap_err();

    assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KdcErrPolicy));

    server.shutdown().await;
}

#[tokio::test]
async fn renewable_tgt_is_renewed() {
    let server = start_kdc().await;
    let client = client_for(&server, |config| {
        config.ticket_lifetime = Duration::hours(2);
        config.renewable_lifetime = Some(Duration::hours(20));
    });

    let tgt = client.authenticate(&alice()).await.unwrap();
    assert_ne!(tgt.flags & TicketFlags::RENEWABLE.bits(), 0);
    let renew_till = tgt.renew_till.expect("renewable TGT carries renew-till");

    let renewed = client.renew(&tgt).await.unwrap();

    assert_eq!(renewed.client, tgt.client);
    assert_eq!(renewed.service, tgt.service);
    assert_eq!(renewed.renew_till, Some(renew_till));
    assert!(renewed.start_time.unwrap_or(renewed.auth_time) >= tgt.auth_time);
    // renewal mints a fresh session key
    assert_ne!(renewed.session_key.as_bytes(), tgt.session_key.as_bytes());

    server.shutdown().await;
}

#[tokio::test]
async fn non_renewable_ticket_cannot_be_renewed() {
    let server = start_kdc().await;
    let client = client_for(&server, |_| {});

    let tgt = client.authenticate(&alice()).await.unwrap();
    assert!(tgt.renew_till.is_none());

    let err = client.renew(&tgt).await.unwrap_err();

    assert_eq!(err.error_type, kerberos::ErrorKind::InvalidOperation);

    server.shutdown().await;
}
