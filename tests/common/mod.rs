// * Shared helpers for integration tests: a local hyper server and generated images
#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use snapcrawler::refinery::{compute_phash, PHash};
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl Route {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some("image/png"),
            body: bytes,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: Some("text/plain"),
            body: b"nope".to_vec(),
        }
    }

    pub fn html() -> Self {
        Self {
            status: 200,
            content_type: Some("text/html; charset=utf-8"),
            body: b"<html><body>not an image</body></html>".to_vec(),
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

// * Serves fixed routes on an ephemeral port; unknown paths are 404
pub async fn serve(routes: HashMap<String, Route>) -> TestServer {
    let routes = Arc::new(routes);
    let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let service_routes = Arc::clone(&routes);
    let service_hits = Arc::clone(&hits);
    let make_svc = make_service_fn(move |_conn| {
        let routes = Arc::clone(&service_routes);
        let hits = Arc::clone(&service_hits);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let routes = Arc::clone(&routes);
                let hits = Arc::clone(&hits);
                async move {
                    let path = req.uri().path().to_string();
                    *hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
                    let route = routes.get(&path).cloned().unwrap_or_else(|| Route::status(404));

                    let mut response = Response::new(Body::from(route.body));
                    *response.status_mut() = StatusCode::from_u16(route.status).unwrap();
                    if let Some(ct) = route.content_type {
                        response
                            .headers_mut()
                            .insert("content-type", ct.parse().unwrap());
                    }
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    TestServer { addr, hits }
}

// * Smooth, structured RGB test card; `seed` shifts the pattern
pub fn test_card(width: u32, height: u32, seed: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let r = ((x + seed * 37) * 255 / width.max(1)) as u8;
        let g = ((y + seed * 53) * 255 / height.max(1)) as u8;
        let b = if ((x / 64) + (y / 64) + seed) % 2 == 0 { 200 } else { 40 };
        Rgb([r, g, b])
    })
}

pub fn phash_of(image: &RgbImage) -> PHash {
    compute_phash(&DynamicImage::ImageRgb8(image.clone()))
}

// * Brightens a centred patch step by step until the hash first moves.
// * Returns the variant and its Hamming distance from the original.
pub fn near_duplicate(image: &RgbImage) -> (RgbImage, u32) {
    let base = phash_of(image);
    let (width, height) = image.dimensions();
    let (x0, x1) = (width / 4, width * 3 / 4);
    let (y0, y1) = (height / 4, height * 3 / 4);

    for lift in (2..=160u8).step_by(2) {
        let mut variant = image.clone();
        for y in y0..y1 {
            for x in x0..x1 {
                let p = variant.get_pixel_mut(x, y);
                for channel in p.0.iter_mut() {
                    *channel = channel.saturating_add(lift);
                }
            }
        }
        let distance = base.distance(&phash_of(&variant));
        if distance > 0 {
            return (variant, distance);
        }
    }
    panic!("no brightness lift moved the hash");
}

pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}
